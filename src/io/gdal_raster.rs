use crate::io::raster::{Raster, RasterDataType, RasterIo, Resampling};
use crate::types::{CoregError, CoregResult, GeoTransform};
use gdal::raster::{Buffer, GdalDataType, GdalType, RasterCreationOption};
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::{Array3, Axis};
use num_traits::NumCast;
use std::path::Path;
use std::process::Command;

/// GeoTIFF access through GDAL; reprojection shells out to `gdalwarp`
#[derive(Debug, Clone, Default)]
pub struct GdalRasterIo;

impl GdalRasterIo {
    pub fn new() -> Self {
        Self
    }

    fn data_type(band_type: GdalDataType) -> RasterDataType {
        match band_type {
            GdalDataType::UInt8 => RasterDataType::UInt8,
            GdalDataType::UInt16 => RasterDataType::UInt16,
            GdalDataType::Int16 => RasterDataType::Int16,
            GdalDataType::UInt32 => RasterDataType::UInt32,
            GdalDataType::Int32 => RasterDataType::Int32,
            GdalDataType::Float32 => RasterDataType::Float32,
            _ => RasterDataType::Float64,
        }
    }

    fn crs_of(dataset: &Dataset) -> Option<String> {
        if let Ok(srs) = dataset.spatial_ref() {
            if let (Ok(name), Ok(code)) = (srs.auth_name(), srs.auth_code()) {
                return Some(format!("{}:{}", name, code));
            }
        }
        let wkt = dataset.projection();
        if wkt.trim().is_empty() {
            None
        } else {
            Some(wkt)
        }
    }

    fn write_typed<T>(path: &Path, raster: &Raster) -> CoregResult<()>
    where
        T: GdalType + NumCast + Copy,
    {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (width, height) = raster.size();
        let compression = raster.compression.clone().unwrap_or_else(|| "LZW".to_string());
        let options = [RasterCreationOption {
            key: "COMPRESS",
            value: &compression,
        }];

        let mut dataset = driver.create_with_band_type_with_options::<T, _>(
            path,
            width as isize,
            height as isize,
            raster.band_count() as isize,
            &options,
        )?;
        dataset.set_geo_transform(&raster.geo_transform.to_gdal())?;
        dataset.set_projection(&Self::projection_for(&raster.crs)?)?;

        for (index, band_values) in raster.bands.axis_iter(Axis(0)).enumerate() {
            let data = band_values
                .iter()
                .map(|v| {
                    <T as NumCast>::from(*v).ok_or_else(|| {
                        CoregError::InvalidFormat(format!(
                            "value {} does not fit {:?} when writing {}",
                            v,
                            raster.data_type,
                            path.display()
                        ))
                    })
                })
                .collect::<CoregResult<Vec<T>>>()?;
            let mut band = dataset.rasterband(index as isize + 1)?;
            band.write((0, 0), (width, height), &Buffer::new((width, height), data))?;
            if let Some(nodata) = raster.nodata {
                band.set_no_data_value(Some(nodata))?;
            }
        }
        Ok(())
    }

    /// GDAL wants WKT for `set_projection`; authority codes are expanded first
    fn projection_for(crs: &str) -> CoregResult<String> {
        if let Some(code) = crs.strip_prefix("EPSG:") {
            let epsg: u32 = code
                .trim()
                .parse()
                .map_err(|_| CoregError::InvalidFormat(format!("bad EPSG code '{}'", crs)))?;
            return Ok(gdal::spatial_ref::SpatialRef::from_epsg(epsg)?.to_wkt()?);
        }
        Ok(crs.to_string())
    }
}

impl RasterIo for GdalRasterIo {
    fn read(&self, path: &Path) -> CoregResult<Raster> {
        log::debug!("Reading raster {}", path.display());
        let dataset = Dataset::open(path)
            .map_err(|e| CoregError::conditioning(path, format!("cannot open: {}", e)))?;
        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count() as usize;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let compression = dataset.metadata_item("COMPRESSION", "IMAGE_STRUCTURE");
        let crs = Self::crs_of(&dataset).unwrap_or_default();

        let mut bands = Array3::<f64>::zeros((band_count, height, width));
        let mut nodata = None;
        let mut data_type = RasterDataType::Float64;
        for index in 0..band_count {
            let band = dataset.rasterband(index as isize + 1)?;
            if index == 0 {
                nodata = band.no_data_value();
                data_type = Self::data_type(band.band_type());
            }
            let buffer = band.read_as::<f64>((0, 0), (width, height), (width, height), None)?;
            let plane = ndarray::Array2::from_shape_vec((height, width), buffer.data)
                .map_err(|e| CoregError::InvalidFormat(format!("band {}: {}", index + 1, e)))?;
            bands.index_axis_mut(Axis(0), index).assign(&plane);
        }

        Ok(Raster {
            bands,
            geo_transform,
            crs,
            nodata,
            data_type,
            compression,
        })
    }

    fn write(&self, path: &Path, raster: &Raster) -> CoregResult<()> {
        log::debug!(
            "Writing {} band {:?} raster to {}",
            raster.band_count(),
            raster.data_type,
            path.display()
        );
        match raster.data_type {
            RasterDataType::UInt8 => Self::write_typed::<u8>(path, raster),
            RasterDataType::UInt16 => Self::write_typed::<u16>(path, raster),
            RasterDataType::Int16 => Self::write_typed::<i16>(path, raster),
            RasterDataType::UInt32 => Self::write_typed::<u32>(path, raster),
            RasterDataType::Int32 => Self::write_typed::<i32>(path, raster),
            RasterDataType::Float32 => Self::write_typed::<f32>(path, raster),
            RasterDataType::Float64 => Self::write_typed::<f64>(path, raster),
        }
    }

    fn crs(&self, path: &Path) -> CoregResult<String> {
        let dataset = Dataset::open(path)
            .map_err(|e| CoregError::conditioning(path, format!("cannot open: {}", e)))?;
        Self::crs_of(&dataset).ok_or_else(|| CoregError::conditioning(path, "raster has no CRS"))
    }

    fn reproject(
        &self,
        src: &Path,
        dst: &Path,
        target_crs: &str,
        resampling: Resampling,
    ) -> CoregResult<()> {
        log::info!("Warping {} to {}", src.display(), target_crs);
        let dataset = Dataset::open(src)
            .map_err(|e| CoregError::conditioning(src, format!("cannot open: {}", e)))?;
        let (x_res, y_res) = GeoTransform::from_gdal(dataset.geo_transform()?).resolution();
        let nodata = dataset.rasterband(1)?.no_data_value();
        let compression = dataset
            .metadata_item("COMPRESSION", "IMAGE_STRUCTURE")
            .unwrap_or_else(|| "LZW".to_string());
        drop(dataset);

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut args: Vec<String> = vec![
            "-of".into(),
            "GTiff".into(),
            "-overwrite".into(),
            "-r".into(),
            resampling.as_gdal_name().into(),
            "-t_srs".into(),
            target_crs.into(),
            "-tr".into(),
            x_res.to_string(),
            y_res.to_string(),
            "-co".into(),
            format!("COMPRESS={}", compression),
        ];
        if let Some(value) = nodata {
            args.push("-srcnodata".into());
            args.push(value.to_string());
            args.push("-dstnodata".into());
            args.push(value.to_string());
        }
        args.push(src.display().to_string());
        args.push(dst.display().to_string());

        let status = Command::new("gdalwarp")
            .args(args.iter().map(|s| s.as_str()))
            .status()
            .map_err(|e| CoregError::conditioning(src, format!("gdalwarp exec error: {}", e)))?;
        if !status.success() {
            let _ = std::fs::remove_file(dst);
            return Err(CoregError::conditioning(src, "gdalwarp failed"));
        }
        Ok(())
    }
}
