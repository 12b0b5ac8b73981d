pub mod modes;
pub mod run;
