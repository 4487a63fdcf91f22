pub mod consolidate;
