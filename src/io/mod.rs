//! I/O modules for rasters, result files and session directories

pub mod raster;
pub mod memory;
#[cfg(feature = "gdal")]
pub mod gdal_raster;
pub mod results;
pub mod session;

pub use raster::{Raster, RasterDataType, RasterIo, Resampling};
pub use memory::MemoryRasterIo;
#[cfg(feature = "gdal")]
pub use gdal_raster::GdalRasterIo;
pub use results::{load_results, save_results, write_filter_csv};
pub use session::{
    create_coregistered_directory, extract_date_from_filename, filtered_dates_by_satellite,
    find_satellite_in_filename, save_coregistered_config, Satellite,
};
