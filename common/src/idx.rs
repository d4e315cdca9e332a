//! Decoder for the big-endian IDX containers used by handwritten-digit
//! datasets: an `idx3` images file paired with an `idx1` labels file.

use crate::error::{DatasetError, FormatError, IdxFile};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

pub const IMAGES_MAGIC: u32 = 0x0000_0803;
pub const LABELS_MAGIC: u32 = 0x0000_0801;

const IMAGES_HEADER_LEN: usize = 16;
const LABELS_HEADER_LEN: usize = 8;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One labelled image. `pixels` is a view into the dataset's shared buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub label: u8,
    pub pixels: Bytes,
}

/// Labelled images of a fixed `width * height` size, stored as one flat pixel
/// buffer. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    width: usize,
    height: usize,
    labels: Vec<u8>,
    pixels: Bytes,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn image_len(&self) -> usize {
        self.width * self.height
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn get(&self, index: usize) -> Option<Example> {
        (index < self.len()).then(|| self.example_at(index))
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = Example> + '_ {
        (0..self.len()).map(move |i| self.example_at(i))
    }

    fn example_at(&self, index: usize) -> Example {
        let start = index * self.image_len();
        Example {
            label: self.labels[index],
            pixels: self.pixels.slice(start..start + self.image_len()),
        }
    }
}

struct ImagesHeader {
    count: usize,
    width: usize,
    height: usize,
}

fn header_reader(buf: &[u8], file: IdxFile, needed: usize) -> Result<Cursor<&[u8]>, FormatError> {
    if buf.len() < needed {
        return Err(FormatError::TruncatedHeader {
            file,
            needed,
            found: buf.len(),
        });
    }
    Ok(Cursor::new(&buf[..needed]))
}

// The header length was checked up front, so the reads below cannot run dry.
fn read_u32(r: &mut Cursor<&[u8]>) -> u32 {
    r.read_u32::<BigEndian>().unwrap_or_default()
}

fn read_i32(r: &mut Cursor<&[u8]>) -> i32 {
    r.read_i32::<BigEndian>().unwrap_or_default()
}

fn check_magic(file: IdxFile, expected: u32, found: u32) -> Result<(), FormatError> {
    if found != expected {
        return Err(FormatError::BadMagic {
            file,
            expected,
            found,
        });
    }
    Ok(())
}

fn check_count(file: IdxFile, value: i32) -> Result<usize, FormatError> {
    if value < 0 {
        return Err(FormatError::NegativeCount { file, value });
    }
    Ok(value as usize)
}

fn check_dimension(dimension: &'static str, value: i32) -> Result<usize, FormatError> {
    if value <= 0 {
        return Err(FormatError::NonPositiveDimension {
            file: IdxFile::Images,
            dimension,
            value,
        });
    }
    Ok(value as usize)
}

fn check_payload(file: IdxFile, header_len: usize, expected: u64, buf_len: usize) -> Result<(), FormatError> {
    let found = (buf_len - header_len) as u64;
    if found < expected {
        return Err(FormatError::TruncatedPayload {
            file,
            expected,
            found,
        });
    }
    Ok(())
}

fn parse_images_header(buf: &[u8]) -> Result<ImagesHeader, FormatError> {
    let mut r = header_reader(buf, IdxFile::Images, IMAGES_HEADER_LEN)?;
    check_magic(IdxFile::Images, IMAGES_MAGIC, read_u32(&mut r))?;
    let count = check_count(IdxFile::Images, read_i32(&mut r))?;
    let width = check_dimension("width", read_i32(&mut r))?;
    let height = check_dimension("height", read_i32(&mut r))?;
    Ok(ImagesHeader {
        count,
        width,
        height,
    })
}

fn parse_labels_header(buf: &[u8]) -> Result<usize, FormatError> {
    let mut r = header_reader(buf, IdxFile::Labels, LABELS_HEADER_LEN)?;
    check_magic(IdxFile::Labels, LABELS_MAGIC, read_u32(&mut r))?;
    check_count(IdxFile::Labels, read_i32(&mut r))
}

/// Decodes an images/labels pair into a [`Dataset`].
///
/// Both buffers must hold raw (already decompressed) IDX bytes. The pixel
/// payload is sliced out of `images` without copying. Bytes beyond the
/// declared payload are ignored.
pub fn decode(images: impl Into<Bytes>, labels: &[u8]) -> Result<Dataset, FormatError> {
    let images: Bytes = images.into();

    let header = parse_images_header(&images)?;
    let image_len = header.width as u64 * header.height as u64;
    let payload_len = (header.count as u64).saturating_mul(image_len);
    check_payload(IdxFile::Images, IMAGES_HEADER_LEN, payload_len, images.len())?;

    let label_count = parse_labels_header(labels)?;
    check_payload(IdxFile::Labels, LABELS_HEADER_LEN, label_count as u64, labels.len())?;

    if label_count != header.count {
        return Err(FormatError::CountMismatch {
            images: header.count,
            labels: label_count,
        });
    }

    let pixels_end = IMAGES_HEADER_LEN + payload_len as usize;
    Ok(Dataset {
        width: header.width,
        height: header.height,
        labels: labels[LABELS_HEADER_LEN..LABELS_HEADER_LEN + label_count].to_vec(),
        pixels: images.slice(IMAGES_HEADER_LEN..pixels_end),
    })
}

pub fn images_path(folder: &Path, prefix: &str) -> PathBuf {
    folder.join(format!("{prefix}-images-idx3-ubyte.gz"))
}

pub fn labels_path(folder: &Path, prefix: &str) -> PathBuf {
    folder.join(format!("{prefix}-labels-idx1-ubyte.gz"))
}

/// Reads a file, gunzipping it when it starts with the gzip magic.
fn read_idx_file(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };

    let raw = std::fs::read(path).map_err(io_err)?;
    if !raw.starts_with(&GZIP_MAGIC) {
        return Ok(raw);
    }

    let mut contents = Vec::with_capacity(raw.len() * 4);
    GzDecoder::new(raw.as_slice())
        .read_to_end(&mut contents)
        .map_err(io_err)?;
    Ok(contents)
}

/// Loads `<prefix>-images-idx3-ubyte.gz` and `<prefix>-labels-idx1-ubyte.gz`
/// from `folder`.
pub fn load_dataset(folder: impl AsRef<Path>, prefix: &str) -> Result<Dataset, DatasetError> {
    let folder = folder.as_ref();
    let images = read_idx_file(&images_path(folder, prefix))?;
    let labels = read_idx_file(&labels_path(folder, prefix))?;
    Ok(decode(images, &labels)?)
}
