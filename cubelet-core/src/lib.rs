pub mod aggregate_scanner;
pub mod config;
pub mod cuboid;
pub mod grid_block;
pub mod grid_table;
pub mod lattice;
pub mod measure;
pub mod memory_budget;
pub mod tool;
pub mod writer;
