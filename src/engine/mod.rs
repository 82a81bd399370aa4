pub mod bonds;
pub mod calendar;
pub mod cells;
pub mod potential;
pub mod thermostat;
