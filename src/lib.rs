#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]

//! Nebula: a distributed asynchronous ray-tracing engine for large
//! scientific data.
//!
//! Data is spatially partitioned across a fixed peer group; each rank
//! owns one rectilinear sub-box of the global domain. Rays trace through
//! whichever rank holds their current position and migrate to the face
//! neighbor when they cross an internal partition boundary. Pixel
//! contributions route to the rank owning the target image, and a
//! two-phase distributed termination detector decides when a frame has
//! fully drained.

pub mod camera;
pub mod comm;
pub mod datasets;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod geometry;
pub mod image_writer;
pub mod lighting;
pub mod partition;
pub mod rays;
pub mod registry;
pub mod renderer;
pub mod rendering;
pub mod state;
pub mod vis;

pub use camera::Camera;
pub use datasets::{DataKind, Datasets};
pub use engine::Engine;
pub use errors::{NebulaError, Result};
pub use geometry::Box3;
pub use lighting::{LightSource, Lighting};
pub use partition::{Partition, PartitionMeta};
pub use rays::{RayList, RayListKind, RayType, TermFlags};
pub use registry::{CommitBody, Key, Registry};
pub use renderer::{Renderer, RendererConfig, RendererKind};
pub use rendering::{FrameBuffer, Rendering, RenderingMeta, RenderingSet};
pub use state::StateFile;
pub use vis::{Vis, VisParams, Visualization};
