pub mod control;
pub mod models;
pub mod track;
