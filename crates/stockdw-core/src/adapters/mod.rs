//! Provider adapters implementing [`crate::DataSource`].

mod yahoo;

pub use yahoo::YahooAdapter;
