pub mod deal;
pub mod stage;
