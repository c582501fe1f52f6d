//! Masked zonal-aggregation engine for forest-loss statistics.
//!
//! Sums a value raster (pixel area, biomass) grouped by the codes of a
//! classification raster (years since loss) under polygon footprints, with a
//! tree-cover-density mask applied first. Rasters, tables and the zonal math
//! itself live behind the [`raster::RasterStore`], [`tables::TableStore`] and
//! [`zonal::ZonalEngine`] collaborator traits; [`grid`] provides in-memory
//! implementations of all three.
//!
//! Entry points are [`analysis::tree_cover_loss`] and
//! [`analysis::biomass_loss`].

pub mod analysis;
pub mod batch;
pub mod error;
pub mod features;
pub mod format;
pub mod geometry;
pub mod grid;
pub mod raster;
pub mod tables;
pub mod zonal;

pub use error::ZonalError;
