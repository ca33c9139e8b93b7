pub mod brain;
pub mod core;
pub mod userhash;
