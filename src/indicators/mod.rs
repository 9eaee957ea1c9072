// Bar-strength indicator and leverage scaling
pub mod ibs;

pub use ibs::{calculate_ibs, determine_leverage};
