// SPDX-License-Identifier: AGPL-3.0-only

//! Frames, planes and the colored-frame variant
//!
//! The filter logic works on one 8-bit plane at a time. Multi-channel frames
//! are split into planes, each plane goes through one trigger protocol pass,
//! and the processed planes are merged back in channel order.
//!
//! The [`Converter`] stands in for the capture front end: it turns whatever
//! the source delivers into frames of the geometry the card was configured
//! for.

use crate::communicator::Communicator;
use crate::driver::CardDriver;
use crate::error::{FilterError, Result};
use crate::trigger::TriggerProtocol;
use filter_chip::regs;
use image::imageops::FilterType;
use image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Image geometry in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    /// Columns
    pub width: usize,
    /// Rows
    pub height: usize,
}

impl ImageSize {
    /// 320×240
    pub const SMALL: Self = Self::new(320, 240);
    /// 640×480
    pub const MIDDLE: Self = Self::new(640, 480);
    /// 800×600
    pub const LARGE: Self = Self::new(800, 600);

    /// Geometry from width and height
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Pixels per plane
    pub const fn area(&self) -> usize {
        self.width * self.height
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::MIDDLE
    }
}

impl FromStr for ImageSize {
    type Err = FilterError;

    /// Accepts the preset names or `WIDTHxHEIGHT`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "small" => return Ok(Self::SMALL),
            "middle" => return Ok(Self::MIDDLE),
            "large" => return Ok(Self::LARGE),
            _ => {}
        }

        let parsed = s.split_once(['x', 'X']).and_then(|(w, h)| {
            let width = w.trim().parse().ok()?;
            let height = h.trim().parse().ok()?;
            Some(Self::new(width, height))
        });
        match parsed {
            Some(size) if size.area() > 0 => Ok(size),
            _ => Err(FilterError::invalid_config(format!(
                "unknown image size '{s}' (small, middle, large or WIDTHxHEIGHT)"
            ))),
        }
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Interleaved 8-bit frame, channels in RGB(A) order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap interleaved pixel data
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` if `data` does not hold exactly
    /// `width × height × channels` bytes or `channels` is zero.
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<u8>) -> Result<Self> {
        if channels == 0 {
            return Err(FilterError::frame_mismatch("frame has no channels"));
        }
        let expected = width * height * channels;
        if data.len() != expected {
            return Err(FilterError::frame_mismatch(format!(
                "{width}x{height}x{channels} frame needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Black frame
    pub fn zeroed(size: ImageSize, channels: usize) -> Self {
        Self {
            width: size.width,
            height: size.height,
            channels: channels.max(1),
            data: vec![0; size.area() * channels.max(1)],
        }
    }

    /// Columns
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Rows
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Geometry
    pub const fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    /// Interleaved channels per pixel
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes per plane
    pub const fn plane_size(&self) -> usize {
        self.width * self.height
    }

    /// Interleaved pixel data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable interleaved pixel data
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// De-interleave into one plane per channel
    pub fn split_planes(&self) -> Vec<Vec<u8>> {
        if self.channels == 1 {
            return vec![self.data.clone()];
        }
        (0..self.channels)
            .map(|c| self.data.iter().skip(c).step_by(self.channels).copied().collect())
            .collect()
    }

    /// Interleave planes back into a frame, plane `i` becoming channel `i`
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` if there are no planes or a plane is not
    /// `width × height` bytes.
    pub fn merge_planes(width: usize, height: usize, planes: &[Vec<u8>]) -> Result<Self> {
        let channels = planes.len();
        let area = width * height;
        if let Some(bad) = planes.iter().position(|p| p.len() != area) {
            return Err(FilterError::frame_mismatch(format!(
                "plane {bad} has {} bytes, expected {area}",
                planes[bad].len()
            )));
        }

        let mut data = vec![0; area * channels];
        for (c, plane) in planes.iter().enumerate() {
            for (pixel, &value) in plane.iter().enumerate() {
                data[pixel * channels + c] = value;
            }
        }
        Self::new(width, height, channels, data)
    }

    /// `left` and `right` next to each other
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` unless both frames have the same height and
    /// channel count.
    pub fn side_by_side(left: &Self, right: &Self) -> Result<Self> {
        if left.height != right.height || left.channels != right.channels {
            return Err(FilterError::frame_mismatch(format!(
                "cannot combine {}x{}x{} with {}x{}x{}",
                left.width, left.height, left.channels, right.width, right.height, right.channels
            )));
        }

        let left_row = left.width * left.channels;
        let right_row = right.width * right.channels;
        let mut data = Vec::with_capacity(left.data.len() + right.data.len());
        for (l, r) in left
            .data
            .chunks_exact(left_row.max(1))
            .zip(right.data.chunks_exact(right_row.max(1)))
        {
            data.extend_from_slice(l);
            data.extend_from_slice(r);
        }
        Self::new(left.width + right.width, left.height, left.channels, data)
    }

    /// Read the next raw frame of the given geometry
    ///
    /// Returns `None` at a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns `Io` on read failure or a truncated final frame.
    pub fn read_raw<R: Read>(reader: &mut R, size: ImageSize, channels: usize) -> Result<Option<Self>> {
        let mut data = vec![0; size.area() * channels];
        let mut filled = 0;
        while filled < data.len() {
            match reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        if filled == 0 && !data.is_empty() {
            return Ok(None);
        }
        if filled < data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated frame: {filled} of {} bytes", data.len()),
            )
            .into());
        }
        Self::new(size.width, size.height, channels, data).map(Some)
    }

    /// Copy into an `image` buffer of the matching color type
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` for more than four channels or dimensions
    /// that do not fit in `u32`.
    pub fn to_image(&self) -> Result<DynamicImage> {
        let width = dimension(self.width)?;
        let height = dimension(self.height)?;
        let data = self.data.clone();
        let image = match self.channels {
            1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
            2 => GrayAlphaImage::from_raw(width, height, data).map(DynamicImage::ImageLumaA8),
            3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
            4 => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
            _ => None,
        };
        image.ok_or_else(|| {
            FilterError::frame_mismatch(format!("no image layout for {} channels", self.channels))
        })
    }

    /// Frame from an 8-bit `image` buffer; other depths are converted to RGBA8
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` if the buffer size disagrees with its geometry.
    pub fn from_image(image: DynamicImage) -> Result<Self> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let (channels, data) = match image {
            DynamicImage::ImageLuma8(buffer) => (1, buffer.into_raw()),
            DynamicImage::ImageLumaA8(buffer) => (2, buffer.into_raw()),
            DynamicImage::ImageRgb8(buffer) => (3, buffer.into_raw()),
            DynamicImage::ImageRgba8(buffer) => (4, buffer.into_raw()),
            other => (4, other.to_rgba8().into_raw()),
        };
        Self::new(width, height, channels, data)
    }

    /// Save to `path`, format chosen by its extension
    ///
    /// # Errors
    ///
    /// Returns `Image` on encode or write failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.to_image()?.save(path)?;
        Ok(())
    }
}

fn dimension(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| FilterError::frame_mismatch(format!("dimension {value} too large")))
}

/// Resampling filter used when resizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Nearest neighbour
    Nearest,
    /// Bilinear
    #[default]
    Linear,
}

/// Capture front end conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    /// Luma only, resized
    Grayscale {
        /// Output geometry
        size: ImageSize,
        /// Resampling filter
        interpolation: Interpolation,
    },
    /// Channels unchanged, resized
    Resize {
        /// Output geometry
        size: ImageSize,
        /// Resampling filter
        interpolation: Interpolation,
    },
    /// Gray to three channels or three channels to four, resized
    ColorExpand {
        /// Output geometry
        size: ImageSize,
        /// Resampling filter
        interpolation: Interpolation,
    },
}

impl Converter {
    /// Output geometry
    pub const fn size(&self) -> ImageSize {
        match self {
            Self::Grayscale { size, .. } | Self::Resize { size, .. } | Self::ColorExpand { size, .. } => *size,
        }
    }

    /// Channel count produced from `input` channels
    pub const fn output_channels(&self, input: usize) -> usize {
        match self {
            Self::Grayscale { .. } => 1,
            Self::Resize { .. } => input,
            Self::ColorExpand { .. } => match input {
                1 => 3,
                3 => 4,
                n => n,
            },
        }
    }

    /// Convert one captured frame
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` for channel counts the conversion does not
    /// handle.
    pub fn convert(&self, frame: &Frame) -> Result<Frame> {
        let image = frame.to_image()?;
        let converted = match *self {
            Self::Grayscale { .. } => match frame.channels {
                1 => image,
                2..=4 => DynamicImage::ImageLuma8(image.to_luma8()),
                n => return Err(FilterError::frame_mismatch(format!("cannot convert {n} channels to gray"))),
            },
            Self::Resize { .. } => image,
            Self::ColorExpand { .. } => match frame.channels {
                1 => DynamicImage::ImageRgb8(image.to_rgb8()),
                3 => DynamicImage::ImageRgba8(image.to_rgba8()),
                4 => image,
                n => return Err(FilterError::frame_mismatch(format!("cannot expand {n} channels"))),
            },
        };
        Frame::from_image(resize(converted, self.size(), self.interpolation())?)
    }

    const fn interpolation(&self) -> Interpolation {
        match self {
            Self::Grayscale { interpolation, .. }
            | Self::Resize { interpolation, .. }
            | Self::ColorExpand { interpolation, .. } => *interpolation,
        }
    }
}

impl From<Interpolation> for FilterType {
    fn from(interpolation: Interpolation) -> Self {
        match interpolation {
            Interpolation::Nearest => Self::Nearest,
            Interpolation::Linear => Self::Triangle,
        }
    }
}

fn resize(image: DynamicImage, size: ImageSize, interpolation: Interpolation) -> Result<DynamicImage> {
    let width = dimension(size.width)?;
    let height = dimension(size.height)?;
    if image.width() == width && image.height() == height {
        return Ok(image);
    }
    Ok(image.resize_exact(width, height, interpolation.into()))
}

/// Run a multi-channel frame through the filter, one plane per pass
///
/// Planes go through bank 0 / bank 1 strictly one after another, and come
/// back in channel order. The plane size must match the image size the
/// card was configured with.
///
/// # Errors
///
/// Returns `FrameMismatch` on a size mismatch, or the first error of any
/// pass; no merged frame is produced in that case.
pub fn run_colored<D: CardDriver>(
    protocol: &mut TriggerProtocol,
    com: &mut Communicator<D>,
    frame: &Frame,
) -> Result<Frame> {
    let configured = com.read_register(regs::IMAGE_SIZE) as usize;
    if configured != frame.plane_size() {
        return Err(FilterError::frame_mismatch(format!(
            "plane of {} bytes, card configured for {configured}",
            frame.plane_size()
        )));
    }

    let planes = frame.split_planes();
    let mut processed = Vec::with_capacity(planes.len());
    for (channel, plane) in planes.iter().enumerate() {
        let mut out = vec![0; plane.len()];
        let polls = protocol.run(com, plane, &mut out)?;
        debug!("Channel {channel} done after {polls} polls");
        processed.push(out);
    }

    Frame::merge_planes(frame.width, frame.height, &processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_2x1() -> Frame {
        Frame::new(2, 1, 3, vec![1, 2, 3, 4, 5, 6]).unwrap()
    }

    #[test]
    fn planes_split_and_merge_in_channel_order() {
        let frame = rgb_2x1();
        let planes = frame.split_planes();
        assert_eq!(planes, vec![vec![1, 4], vec![2, 5], vec![3, 6]]);
        assert_eq!(Frame::merge_planes(2, 1, &planes).unwrap(), frame);
    }

    #[test]
    fn merge_rejects_short_plane() {
        let err = Frame::merge_planes(2, 1, &[vec![1, 2], vec![3]]).unwrap_err();
        assert!(matches!(err, FilterError::FrameMismatch { .. }));
    }

    #[test]
    fn side_by_side_interleaves_rows() {
        let left = Frame::new(1, 2, 1, vec![1, 2]).unwrap();
        let right = Frame::new(2, 2, 1, vec![10, 11, 20, 21]).unwrap();
        let combined = Frame::side_by_side(&left, &right).unwrap();
        assert_eq!(combined.width(), 3);
        assert_eq!(combined.data(), &[1, 10, 11, 2, 20, 21]);
    }

    #[test]
    fn side_by_side_needs_same_height() {
        let left = Frame::new(1, 1, 1, vec![0]).unwrap();
        let right = Frame::new(1, 2, 1, vec![0, 0]).unwrap();
        assert!(Frame::side_by_side(&left, &right).is_err());
    }

    #[test]
    fn size_presets_parse() {
        assert_eq!("small".parse::<ImageSize>().unwrap(), ImageSize::SMALL);
        assert_eq!("middle".parse::<ImageSize>().unwrap(), ImageSize::new(640, 480));
        assert_eq!("large".parse::<ImageSize>().unwrap().area(), 800 * 600);
        assert_eq!("32x4".parse::<ImageSize>().unwrap(), ImageSize::new(32, 4));
        assert!("huge".parse::<ImageSize>().is_err());
        assert!("0x4".parse::<ImageSize>().is_err());
    }

    #[test]
    fn grayscale_weights_green_most() {
        let gray = Converter::Grayscale {
            size: ImageSize::new(1, 1),
            interpolation: Interpolation::Nearest,
        };
        let white = gray.convert(&Frame::new(1, 1, 3, vec![255, 255, 255]).unwrap()).unwrap();
        assert_eq!(white.data(), &[255]);
        let green = gray.convert(&Frame::new(1, 1, 3, vec![0, 255, 0]).unwrap()).unwrap();
        let blue = gray.convert(&Frame::new(1, 1, 3, vec![0, 0, 255]).unwrap()).unwrap();
        assert!(green.data()[0] > blue.data()[0]);
    }

    #[test]
    fn nearest_downscale_picks_source_pixels() {
        let frame = Frame::new(4, 2, 1, (0..8).collect()).unwrap();
        let resize = Converter::Resize {
            size: ImageSize::new(2, 1),
            interpolation: Interpolation::Nearest,
        };
        let out = resize.convert(&frame).unwrap();
        assert_eq!(out.size(), ImageSize::new(2, 1));
        assert!(out.data().iter().all(|v| frame.data().contains(v)));
    }

    #[test]
    fn linear_upscale_stays_within_range() {
        let frame = Frame::new(2, 1, 1, vec![0, 100]).unwrap();
        let resize = Converter::Resize {
            size: ImageSize::new(4, 1),
            interpolation: Interpolation::Linear,
        };
        let out = resize.convert(&frame).unwrap();
        assert_eq!(out.width(), 4);
        assert!(out.data().iter().all(|&v| v <= 100));
        assert!(out.data().windows(2).all(|w| w[0] <= w[1]));
        assert!(out.data()[0] < out.data()[3]);
    }

    #[test]
    fn color_expand_adds_opaque_alpha() {
        let expand = Converter::ColorExpand {
            size: ImageSize::new(2, 1),
            interpolation: Interpolation::Nearest,
        };
        let out = expand.convert(&rgb_2x1()).unwrap();
        assert_eq!(out.channels(), 4);
        assert_eq!(out.data(), &[1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(expand.output_channels(3), 4);
    }

    #[test]
    fn raw_reader_stops_cleanly_at_end() {
        let bytes = [1u8, 2, 3, 4, 5, 6];
        let mut reader = &bytes[..];
        let size = ImageSize::new(2, 1);
        let first = Frame::read_raw(&mut reader, size, 1).unwrap().unwrap();
        assert_eq!(first.data(), &[1, 2]);
        Frame::read_raw(&mut reader, size, 1).unwrap().unwrap();
        Frame::read_raw(&mut reader, size, 1).unwrap().unwrap();
        assert!(Frame::read_raw(&mut reader, size, 1).unwrap().is_none());
    }

    #[test]
    fn raw_reader_reports_truncation() {
        let bytes = [1u8, 2, 3];
        let mut reader = &bytes[..];
        let size = ImageSize::new(2, 1);
        Frame::read_raw(&mut reader, size, 1).unwrap();
        let err = Frame::read_raw(&mut reader, size, 1).unwrap_err();
        assert!(matches!(err, FilterError::Io { .. }));
    }

    #[test]
    fn saved_png_reloads_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let frame = rgb_2x1();
        frame.save(&path).unwrap();

        let reloaded = Frame::from_image(image::open(&path).unwrap()).unwrap();
        assert_eq!(reloaded, frame);
    }

    #[test]
    fn too_many_channels_have_no_image_layout() {
        let frame = Frame::new(1, 1, 5, vec![0; 5]).unwrap();
        assert!(matches!(frame.to_image(), Err(FilterError::FrameMismatch { .. })));
    }
}
