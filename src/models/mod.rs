pub mod events;
pub mod track;
