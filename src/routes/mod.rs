pub mod diagnostics;
pub mod health;
pub mod logs;
pub mod speed_test;
