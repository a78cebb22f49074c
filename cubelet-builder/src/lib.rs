//! Builders of a cube: every cuboid of a lattice, aggregated from one input stream.
//!
//! A cuboid is a group-by aggregation of the input over a subset of the dimensions. The
//! base cuboid groups by all dimensions, and every other cuboid can be aggregated from any
//! cuboid having more dimensions. The lattice decides which parent spans which child, so
//! a build is a tree walk from the base cuboid.
//!
//! There are two ways to build:
//!
//! 1. `InMemCubeBuilder` aggregates the whole input into the base cuboid, then aggregates
//! the children of each finished cuboid in parallel, on the tokio runtime. Memory of the
//! aggregation caches is reserved from a `MemoryBudgetController` before each cuboid is
//! aggregated, tasks wait while the budget is used up by others.
//! 2. `DoggedCubeBuilder` cuts the input into splits, builds each split with its own
//! `InMemCubeBuilder`, and merges the partial results of the same cuboid from all splits
//! with a k-way merge, `SplitMerger`. It's used when one pass can't fit in memory.
//!
//! Both produce the same rows for every cuboid, because all measure functions are
//! commutative and associative.
//!
//! Why are tables closed explicitly but not by `Drop`?
//!
//! A table is read by its children and by the merger after its own task is finished, and
//! closing must happen exactly once whatever the build outcome. Each builder keeps its
//! results in a `ResultCollector`, and the collectors are walked at the end of the build
//! to close what's left open. The `TableTracker` of the `BuildContext` counts opened and
//! closed tables, so leaks show up in tests.
//!
//! `build_cube` picks the mode from `CubeBuilderConfig`.

pub mod context;
pub mod cube_build;
pub mod cuboid_result;
pub mod dogged_builder;
pub mod in_mem_builder;
pub mod input;
pub mod split_merger;
