pub mod block_index;
pub mod chainstate;
pub mod checkqueue;
pub mod coins;
pub mod notifications;
pub mod params;
pub mod script;
pub mod snapshot;
pub mod types;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_utils;
