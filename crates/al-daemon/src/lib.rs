pub mod daemon;
pub mod observers;
