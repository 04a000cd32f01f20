//! GeoTIFF decode and encode for single-band elevation rasters.
//!
//! Reading tolerates any integer or float sample type and widens to f32.
//! Georeferencing comes from the ModelTiepoint (33922) + ModelPixelScale
//! (33550) tag pair, the nodata sentinel from GDAL_NODATA (42113), and the
//! CRS from the GeoKey directory (34735). Writing always produces tiled
//! f32 output with the same tags so artifacts round-trip through this
//! module byte-for-value.

use crate::grid::RasterGrid;
use crate::{DemError, Result};
use demgrid_tiles::{Bounds, CrsDef};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::Path;
use std::str::FromStr;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::compression::{Compression, Deflate, Lzw, Uncompressed};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

const GEOKEY_MODEL_TYPE: u16 = 1024;
const GEOKEY_RASTER_TYPE: u16 = 1025;
const GEOKEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEOKEY_PROJECTED_TYPE: u16 = 3072;

/// Output compression for normalized artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TiffCompression {
    /// No compression.
    #[default]
    None,
    /// LZW.
    Lzw,
    /// Deflate.
    Deflate,
}

impl TiffCompression {
    /// Canonical lowercase name recorded in build plans.
    pub fn name(&self) -> &'static str {
        match self {
            TiffCompression::None => "none",
            TiffCompression::Lzw => "lzw",
            TiffCompression::Deflate => "deflate",
        }
    }
}

impl FromStr for TiffCompression {
    type Err = DemError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(TiffCompression::None),
            "lzw" => Ok(TiffCompression::Lzw),
            "deflate" => Ok(TiffCompression::Deflate),
            other => Err(DemError::UnknownName {
                kind: "compression",
                value: other.to_string(),
            }),
        }
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    let decoder = Decoder::new(BufReader::new(file))?;
    // Source DEMs can exceed 100M pixels; the default limits are far too
    // small for a full 1/3 arc-second tile.
    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024;
    limits.intermediate_buffer_size = 1024 * 1024 * 1024;
    limits.ifd_value_size = 1024 * 1024 * 1024;
    Ok(decoder.with_limits(limits))
}

fn decode_band<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<f32>> {
    let result = decoder.read_image()?;
    #[allow(unreachable_patterns)]
    Ok(match result {
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
        _ => {
            return Err(DemError::Normalization(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    })
}

fn read_bounds<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> Result<Bounds> {
    let tiepoint = decoder.get_tag_f64_vec(Tag::Unknown(TAG_MODEL_TIEPOINT));
    let scale = decoder.get_tag_f64_vec(Tag::Unknown(TAG_MODEL_PIXEL_SCALE));
    let (tiepoint, scale) = match (tiepoint, scale) {
        (Ok(t), Ok(s)) if t.len() >= 6 && s.len() >= 2 => (t, s),
        _ => {
            return Err(DemError::InvalidGeoTiff {
                path: path.to_path_buf(),
                reason: "missing ModelTiepoint/ModelPixelScale tags".to_string(),
            })
        }
    };
    let (width, height) = decoder.dimensions()?;
    // Tiepoint maps pixel (i, j) to model (x, y); the raster extends east
    // and south from there.
    let min_x = tiepoint[3] - tiepoint[0] * scale[0];
    let max_y = tiepoint[4] + tiepoint[1] * scale[1];
    Ok((
        min_x,
        max_y - height as f64 * scale[1],
        min_x + width as f64 * scale[0],
        max_y,
    ))
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let raw = decoder
        .get_tag_ascii_string(Tag::Unknown(TAG_GDAL_NODATA))
        .ok()?;
    raw.trim_end_matches('\0').trim().parse().ok()
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<u32> {
    let keys = decoder
        .get_tag_u32_vec(Tag::Unknown(TAG_GEO_KEY_DIRECTORY))
        .ok()?;
    if keys.len() < 4 {
        return None;
    }
    let entry_count = keys[3] as usize;
    let mut geographic = None;
    let mut projected = None;
    for entry in 0..entry_count {
        let offset = 4 + entry * 4;
        if offset + 3 >= keys.len() {
            break;
        }
        let key_id = keys[offset];
        let location = keys[offset + 1];
        let value = keys[offset + 3];
        if location != 0 {
            continue;
        }
        if key_id == u32::from(GEOKEY_GEOGRAPHIC_TYPE) {
            geographic = Some(value);
        } else if key_id == u32::from(GEOKEY_PROJECTED_TYPE) {
            projected = Some(value);
        }
    }
    // A projected definition wins; its geographic key only names the datum.
    projected.filter(|&code| code != 32767).or(geographic)
}

/// Decode a GeoTIFF into an in-memory grid.
///
/// Fails when the file carries no georeferencing or no recognizable CRS.
pub fn read_geotiff(path: &Path) -> Result<RasterGrid> {
    let mut decoder = open_decoder(path)?;
    let (width, height) = decoder.dimensions()?;
    let bounds = read_bounds(&mut decoder, path)?;
    let nodata = read_nodata(&mut decoder);
    let code = read_crs(&mut decoder).ok_or_else(|| DemError::MissingCrs(path.to_path_buf()))?;
    let crs = CrsDef::from_authority(&format!("EPSG:{code}"))?;
    let data = decode_band(&mut decoder)?;
    RasterGrid::from_data(width as usize, height as usize, bounds, crs, nodata, data)
}

/// Decode a GeoTIFF, overriding whatever CRS the file declares.
pub fn read_geotiff_with_crs(path: &Path, crs: CrsDef) -> Result<RasterGrid> {
    let mut decoder = open_decoder(path)?;
    let (width, height) = decoder.dimensions()?;
    let bounds = read_bounds(&mut decoder, path)?;
    let nodata = read_nodata(&mut decoder);
    let data = decode_band(&mut decoder)?;
    RasterGrid::from_data(width as usize, height as usize, bounds, crs, nodata, data)
}

/// Header-only metadata for a DEM on disk.
#[derive(Debug, Clone)]
pub struct DemInfo {
    /// File location.
    pub path: std::path::PathBuf,
    /// CRS authority string, if the file declares one.
    pub crs: Option<String>,
    /// Bounds in CRS units.
    pub bounds: Bounds,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Nodata sentinel, if declared.
    pub nodata: Option<f64>,
    /// Pixel size in CRS units.
    pub resolution: (f64, f64),
}

/// Collect metadata about a DEM without decoding the band data.
pub fn inspect_dem(path: &Path) -> Result<DemInfo> {
    let mut decoder = open_decoder(path)?;
    let (width, height) = decoder.dimensions()?;
    let bounds = read_bounds(&mut decoder, path)?;
    let nodata = read_nodata(&mut decoder);
    let crs = read_crs(&mut decoder).map(|code| format!("EPSG:{code}"));
    Ok(DemInfo {
        path: path.to_path_buf(),
        crs,
        bounds,
        width: width as usize,
        height: height as usize,
        nodata,
        resolution: (
            (bounds.2 - bounds.0) / width as f64,
            (bounds.3 - bounds.1) / height as f64,
        ),
    })
}

fn epsg_code(crs: &CrsDef) -> Result<u16> {
    crs.authority
        .strip_prefix("EPSG:")
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| DemError::Normalization(format!("CRS has no EPSG code: {}", crs.authority)))
}

fn format_nodata(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn write_with_compression<D: Compression>(
    path: &Path,
    grid: &RasterGrid,
    compression: D,
) -> Result<()> {
    let file = File::create(path)?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    let mut image = encoder.new_image_with_compression::<Gray32Float, D>(
        grid.width() as u32,
        grid.height() as u32,
        compression,
    )?;
    let (res_x, res_y) = {
        let bounds = grid.bounds();
        (
            (bounds.2 - bounds.0) / grid.width() as f64,
            (bounds.3 - bounds.1) / grid.height() as f64,
        )
    };
    let bounds = grid.bounds();
    let scale = [res_x, res_y, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, bounds.0, bounds.3, 0.0];
    image
        .encoder()
        .write_tag(Tag::Unknown(TAG_MODEL_PIXEL_SCALE), &scale[..])?;
    image
        .encoder()
        .write_tag(Tag::Unknown(TAG_MODEL_TIEPOINT), &tiepoint[..])?;
    let code = epsg_code(grid.crs())?;
    let geokeys: [u16; 16] = if grid.crs().geographic {
        [
            1, 1, 0, 3, GEOKEY_MODEL_TYPE, 0, 1, 2, GEOKEY_RASTER_TYPE, 0, 1, 1,
            GEOKEY_GEOGRAPHIC_TYPE, 0, 1, code,
        ]
    } else {
        [
            1, 1, 0, 3, GEOKEY_MODEL_TYPE, 0, 1, 1, GEOKEY_RASTER_TYPE, 0, 1, 1,
            GEOKEY_PROJECTED_TYPE, 0, 1, code,
        ]
    };
    image
        .encoder()
        .write_tag(Tag::Unknown(TAG_GEO_KEY_DIRECTORY), &geokeys[..])?;
    if let Some(nodata) = grid.nodata() {
        image
            .encoder()
            .write_tag(Tag::Unknown(TAG_GDAL_NODATA), format_nodata(nodata).as_str())?;
    }
    image.write_data(grid.data())?;
    Ok(())
}

/// Encode a grid as a single-band f32 GeoTIFF.
pub fn write_geotiff(path: &Path, grid: &RasterGrid, compression: TiffCompression) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match compression {
        TiffCompression::None => write_with_compression(path, grid, Uncompressed::default()),
        TiffCompression::Lzw => write_with_compression(path, grid, Lzw::default()),
        TiffCompression::Deflate => write_with_compression(path, grid, Deflate::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn crs() -> CrsDef {
        CrsDef::from_authority("EPSG:4326").unwrap()
    }

    fn sample_grid(nodata: Option<f64>) -> RasterGrid {
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        RasterGrid::from_data(4, 4, (8.0, 47.0, 9.0, 48.0), crs(), nodata, data).unwrap()
    }

    #[test]
    fn test_roundtrip_plain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tile.tif");
        let grid = sample_grid(Some(-32768.0));
        write_geotiff(&path, &grid, TiffCompression::None).unwrap();

        let loaded = read_geotiff(&path).unwrap();
        assert_eq!(loaded.width(), 4);
        assert_eq!(loaded.height(), 4);
        assert_eq!(loaded.bounds(), (8.0, 47.0, 9.0, 48.0));
        assert_eq!(loaded.nodata(), Some(-32768.0));
        assert_eq!(loaded.crs().authority, "EPSG:4326");
        assert_eq!(loaded.data(), grid.data());
    }

    #[test]
    fn test_roundtrip_compressed() {
        let dir = TempDir::new().unwrap();
        for compression in [TiffCompression::Lzw, TiffCompression::Deflate] {
            let path = dir.path().join(format!("{}.tif", compression.name()));
            let grid = sample_grid(None);
            write_geotiff(&path, &grid, compression).unwrap();
            let loaded = read_geotiff(&path).unwrap();
            assert_eq!(loaded.data(), grid.data());
            assert_eq!(loaded.nodata(), None);
        }
    }

    #[test]
    fn test_nan_nodata_survives_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nan.tif");
        let mut grid = sample_grid(Some(f64::NAN));
        grid.set(1, 1, f32::NAN);
        write_geotiff(&path, &grid, TiffCompression::None).unwrap();
        let loaded = read_geotiff(&path).unwrap();
        assert!(loaded.nodata().unwrap().is_nan());
        assert!(loaded.get(1, 1).is_nan());
    }

    #[test]
    fn test_inspect_dem() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tile.tif");
        write_geotiff(&path, &sample_grid(Some(-9999.0)), TiffCompression::None).unwrap();
        let info = inspect_dem(&path).unwrap();
        assert_eq!(info.width, 4);
        assert_eq!(info.height, 4);
        assert_eq!(info.crs.as_deref(), Some("EPSG:4326"));
        assert_eq!(info.nodata, Some(-9999.0));
        assert!((info.resolution.0 - 0.25).abs() < 1e-12);
    }
}
