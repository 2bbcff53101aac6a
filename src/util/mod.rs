pub mod num;
pub mod print;
