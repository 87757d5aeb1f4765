pub mod diff;
pub mod kdiff;

pub mod util;
