//! Pipeline passes, run in order by [`crate::DrumGrid::run_pipeline`]

pub mod pass_0;
pub mod pass_1;
pub mod pass_2;
pub mod pass_3;
pub mod pass_4;
pub mod pass_5;
pub mod pass_6;
pub mod pass_7;
pub mod pass_8;
