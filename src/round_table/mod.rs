pub mod engine;
pub mod knight;
pub mod registry;
pub mod seats;
pub mod signaling;
pub mod table;

pub use engine::RoundTable;
