pub mod date_range;
pub mod entity;
pub mod goal;
pub mod hierarchy;
pub mod record;
pub mod store;
