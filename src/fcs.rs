//! Reading and writing Flow Cytometry Standard list-mode files.
//!
//! Versions 2.0, 3.0 and 3.1 are read. Files are always written as FCS 3.1 with double precision
//! little endian data.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use ndarray::Array2;
use thiserror::Error;

use crate::sample::{
    ChannelInfo, ChannelNaming, EventTable, ReadMode, SampleMetadata, SampleReader,
};

/// Result type for FCS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reading or writing FCS files.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unsupported FCS version {0:?}")]
    UnsupportedVersion(String),

    #[error("malformed TEXT segment: {0}")]
    InvalidText(String),

    #[error("missing required keyword {0}")]
    MissingKeyword(String),

    #[error("invalid value {value:?} for keyword {keyword}")]
    InvalidKeyword { keyword: String, value: String },

    #[error("unsupported {keyword} {value:?}")]
    Unsupported { keyword: String, value: String },

    #[error("malformed DATA segment: {0}")]
    InvalidData(String),

    #[error("channel name {0:?} is used by more than one parameter")]
    DuplicateChannel(String),
}

const HEADER_LEN: usize = 58;
const SUPPORTED_VERSIONS: [&str; 3] = ["FCS2.0", "FCS3.0", "FCS3.1"];
const DELIMITER: u8 = b'/';
/// Largest offset which fits in the eight characters reserved for it in the header
const MAX_HEADER_OFFSET: usize = 99_999_999;
const DEFAULT_RANGE: f64 = 262_144.;

/// Reads FCS files through the [`SampleReader`] interface.
#[derive(Clone, Copy, Debug, Default)]
pub struct FcsReader;

impl SampleReader for FcsReader {
    fn parse(
        &self,
        path: &Path,
        mode: ReadMode,
        naming: ChannelNaming,
    ) -> crate::Result<(SampleMetadata, Option<EventTable>)> {
        let parsed = match mode {
            ReadMode::MetadataOnly => read_metadata(path, naming).map(|metadata| (metadata, None)),
            ReadMode::Full => read(path, naming).map(|(metadata, table)| (metadata, Some(table))),
        };
        parsed.map_err(|e| crate::Error::data_format(path, e))
    }
}

#[derive(Debug)]
struct Header {
    version: String,
    /// Inclusive byte offsets of the TEXT segment
    text: (usize, usize),
    /// Inclusive byte offsets of the DATA segment, zero when stored in the keywords instead
    data: (usize, usize),
}

fn parse_offset(field: &[u8]) -> Result<usize> {
    let field = std::str::from_utf8(field)
        .map_err(|_| Error::InvalidHeader("offsets are not ASCII".into()))?
        .trim();
    if field.is_empty() {
        return Ok(0);
    }
    field
        .parse()
        .map_err(|_| Error::InvalidHeader(format!("bad segment offset {field:?}")))
}

fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidHeader(format!(
            "expected {HEADER_LEN} header bytes, found {}",
            bytes.len()
        )));
    }
    if &bytes[..3] != b"FCS" {
        return Err(Error::InvalidHeader("missing FCS magic".into()));
    }
    let version = String::from_utf8_lossy(&bytes[..6]).into_owned();
    if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
        return Err(Error::UnsupportedVersion(version));
    }

    let offsets = (0..4)
        .map(|ii| parse_offset(&bytes[10 + 8 * ii..18 + 8 * ii]))
        .collect::<Result<Vec<_>>>()?;

    let text = (offsets[0], offsets[1]);
    if text.0 < HEADER_LEN || text.1 < text.0 {
        return Err(Error::InvalidHeader(format!(
            "TEXT segment at {}..={} is invalid",
            text.0, text.1
        )));
    }

    Ok(Header {
        version,
        text,
        data: (offsets[2], offsets[3]),
    })
}

/// Split the TEXT segment into keyword/value pairs.
///
/// The first byte is the delimiter, a doubled delimiter is a literal delimiter character. Keywords
/// are case insensitive and are returned upper cased.
fn parse_text(segment: &[u8]) -> Result<BTreeMap<String, String>> {
    let (&delimiter, body) = segment
        .split_first()
        .ok_or_else(|| Error::InvalidText("segment is empty".into()))?;

    let mut tokens = Vec::new();
    let mut current = Vec::new();
    let mut ii = 0;
    while ii < body.len() {
        let byte = body[ii];
        if byte == delimiter {
            if body.get(ii + 1) == Some(&delimiter) {
                current.push(delimiter);
                ii += 2;
                continue;
            }
            tokens.push(String::from_utf8_lossy(&current).into_owned());
            current.clear();
        } else {
            current.push(byte);
        }
        ii += 1;
    }
    // Some writers pad the segment or omit the closing delimiter
    let trailing = String::from_utf8_lossy(&current);
    if !trailing.trim().is_empty() {
        tokens.push(trailing.into_owned());
    }

    if tokens.len() % 2 != 0 {
        return Err(Error::InvalidText(format!(
            "keyword {:?} has no value",
            tokens.last().map_or("", String::as_str)
        )));
    }

    Ok(tokens
        .chunks_exact(2)
        .map(|pair| (pair[0].trim().to_uppercase(), pair[1].trim().to_owned()))
        .collect())
}

struct Keywords<'a>(&'a BTreeMap<String, String>);

impl Keywords<'_> {
    fn optional(&self, keyword: &str) -> Option<&str> {
        self.0.get(keyword).map(String::as_str)
    }

    fn required(&self, keyword: &str) -> Result<&str> {
        self.optional(keyword)
            .ok_or_else(|| Error::MissingKeyword(keyword.to_owned()))
    }

    fn required_usize(&self, keyword: &str) -> Result<usize> {
        let value = self.required(keyword)?;
        value.parse().map_err(|_| Error::InvalidKeyword {
            keyword: keyword.to_owned(),
            value: value.to_owned(),
        })
    }

    fn optional_f64(&self, keyword: &str) -> Result<Option<f64>> {
        self.optional(keyword)
            .map(|value| {
                value.parse().map_err(|_| Error::InvalidKeyword {
                    keyword: keyword.to_owned(),
                    value: value.to_owned(),
                })
            })
            .transpose()
    }
}

fn channels(keywords: &Keywords, naming: ChannelNaming) -> Result<Vec<ChannelInfo>> {
    let num_parameters = keywords.required_usize("$PAR")?;
    // Every parameter has at least its $PnN keyword
    if num_parameters > keywords.0.len() {
        return Err(Error::InvalidKeyword {
            keyword: "$PAR".into(),
            value: num_parameters.to_string(),
        });
    }
    let mut channels: Vec<ChannelInfo> = Vec::with_capacity(num_parameters);
    for n in 1..=num_parameters {
        let pnn = keywords.required(&format!("$P{n}N"))?.to_owned();
        let pns = keywords
            .optional(&format!("$P{n}S"))
            .filter(|pns| !pns.is_empty())
            .map(str::to_owned);
        let name = match (naming, &pns) {
            (ChannelNaming::PnS, Some(pns)) => pns.clone(),
            _ => pnn.clone(),
        };
        if channels.iter().any(|channel| channel.name == name) {
            return Err(Error::DuplicateChannel(name));
        }
        channels.push(ChannelInfo {
            name,
            pnn,
            pns,
            voltage: keywords.optional_f64(&format!("$P{n}V"))?,
            gain: keywords.optional_f64(&format!("$P{n}G"))?,
            range: keywords.optional_f64(&format!("$P{n}R"))?,
        });
    }
    Ok(channels)
}

fn metadata(text: &[u8], naming: ChannelNaming) -> Result<SampleMetadata> {
    let keywords = parse_text(text)?;
    let channels = channels(&Keywords(&keywords), naming)?;
    Ok(SampleMetadata { channels, keywords })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

fn byte_order(value: &str) -> Result<ByteOrder> {
    let unsupported = || Error::Unsupported {
        keyword: "$BYTEORD".into(),
        value: value.to_owned(),
    };
    let positions = value
        .split(',')
        .map(|position| position.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| unsupported())?;

    let n = positions.len();
    if positions.iter().enumerate().all(|(ii, &p)| p == ii + 1) {
        Ok(ByteOrder::Little)
    } else if positions.iter().enumerate().all(|(ii, &p)| p == n - ii) {
        Ok(ByteOrder::Big)
    } else {
        Err(unsupported())
    }
}

#[derive(Clone, Copy, Debug)]
enum DataType {
    Integer,
    Float,
    Double,
}

macro_rules! decode_as {
    ($ty:ty, $chunk:expr, $order:expr) => {{
        let bytes = $chunk
            .try_into()
            .map_err(|_| Error::InvalidData("truncated value".into()))?;
        match $order {
            ByteOrder::Little => <$ty>::from_le_bytes(bytes),
            ByteOrder::Big => <$ty>::from_be_bytes(bytes),
        }
    }};
}

#[allow(clippy::cast_precision_loss)]
fn decode(chunk: &[u8], data_type: DataType, order: ByteOrder) -> Result<f64> {
    Ok(match (data_type, chunk.len()) {
        (DataType::Float, 4) => f64::from(decode_as!(f32, chunk, order)),
        (DataType::Double, 8) => decode_as!(f64, chunk, order),
        (DataType::Integer, 1) => f64::from(chunk[0]),
        (DataType::Integer, 2) => f64::from(decode_as!(u16, chunk, order)),
        (DataType::Integer, 4) => f64::from(decode_as!(u32, chunk, order)),
        (DataType::Integer, 8) => decode_as!(u64, chunk, order) as f64,
        (data_type, width) => {
            return Err(Error::InvalidData(format!(
                "{}-bit values are not valid for {data_type:?} data",
                width * 8
            )))
        }
    })
}

fn events(bytes: &[u8], header: &Header, metadata: &SampleMetadata) -> Result<Array2<f64>> {
    let keywords = Keywords(&metadata.keywords);
    let num_parameters = metadata.channels.len();

    let mode = keywords.optional("$MODE").unwrap_or("L");
    if !mode.eq_ignore_ascii_case("L") {
        return Err(Error::Unsupported {
            keyword: "$MODE".into(),
            value: mode.to_owned(),
        });
    }

    let data_type = match keywords.required("$DATATYPE")?.to_ascii_uppercase().as_str() {
        "I" => DataType::Integer,
        "F" => DataType::Float,
        "D" => DataType::Double,
        other => {
            return Err(Error::Unsupported {
                keyword: "$DATATYPE".into(),
                value: other.to_owned(),
            })
        }
    };
    let order = byte_order(keywords.required("$BYTEORD")?)?;
    let num_events = keywords.required_usize("$TOT")?;

    let widths = (1..=num_parameters)
        .map(|n| {
            let keyword = format!("$P{n}B");
            let bits = keywords.required_usize(&keyword)?;
            if bits == 0 || bits % 8 != 0 {
                return Err(Error::Unsupported {
                    keyword,
                    value: bits.to_string(),
                });
            }
            Ok(bits / 8)
        })
        .collect::<Result<Vec<_>>>()?;

    if num_events == 0 || num_parameters == 0 {
        return Ok(Array2::zeros((num_events, num_parameters)));
    }

    let (begin, end) = if header.data == (0, 0) {
        (
            keywords.required_usize("$BEGINDATA")?,
            keywords.required_usize("$ENDDATA")?,
        )
    } else {
        header.data
    };
    if end < begin || end >= bytes.len() {
        return Err(Error::InvalidData(format!(
            "segment {begin}..={end} lies outside a file of {} bytes",
            bytes.len()
        )));
    }
    let segment = &bytes[begin..=end];

    let event_width = widths
        .iter()
        .try_fold(0usize, |total, &width| total.checked_add(width))
        .ok_or_else(|| Error::InvalidData("event width overflows".into()))?;
    let needed = event_width.checked_mul(num_events).ok_or_else(|| {
        Error::InvalidData(format!(
            "{num_events} events of {event_width} bytes cannot be addressed"
        ))
    })?;
    if segment.len() < needed {
        return Err(Error::InvalidData(format!(
            "{num_events} events of {event_width} bytes need {needed} bytes, segment holds {}",
            segment.len()
        )));
    }

    let mut values = Vec::with_capacity(num_events * num_parameters);
    for event in segment.chunks_exact(event_width).take(num_events) {
        let mut cursor = 0;
        for width in &widths {
            values.push(decode(&event[cursor..cursor + width], data_type, order)?);
            cursor += width;
        }
    }

    Array2::from_shape_vec((num_events, num_parameters), values)
        .map_err(|e| Error::InvalidData(e.to_string()))
}

/// Read only the HEADER and TEXT segments of the file at `path`
///
/// # Errors
/// Returns an error if the file cannot be opened or the segments are malformed.
pub fn read_metadata(path: &Path, naming: ChannelNaming) -> Result<SampleMetadata> {
    let mut file = File::open(path)?;
    let mut header_bytes = [0u8; HEADER_LEN];
    file.read_exact(&mut header_bytes)?;
    let header = parse_header(&header_bytes)?;

    let file_len = file.metadata()?.len();
    if header.text.1 as u64 >= file_len {
        return Err(Error::InvalidText(format!(
            "segment {}..={} lies outside a file of {file_len} bytes",
            header.text.0, header.text.1
        )));
    }
    let mut text = vec![0u8; header.text.1 - header.text.0 + 1];
    file.seek(SeekFrom::Start(header.text.0 as u64))?;
    file.read_exact(&mut text)?;
    metadata(&text, naming)
}

/// Read the metadata and every event of the file at `path`
///
/// # Errors
/// Returns an error if the file cannot be read or any segment is malformed.
pub fn read(path: &Path, naming: ChannelNaming) -> Result<(SampleMetadata, EventTable)> {
    let bytes = fs::read(path)?;
    let header = parse_header(&bytes)?;
    let text = bytes.get(header.text.0..=header.text.1).ok_or_else(|| {
        Error::InvalidText(format!(
            "segment {}..={} lies outside a file of {} bytes",
            header.text.0,
            header.text.1,
            bytes.len()
        ))
    })?;
    let metadata = metadata(text, naming)?;
    log::debug!(
        "{} is {} with {} parameters",
        path.display(),
        header.version,
        metadata.channels.len()
    );

    let data = events(&bytes, &header, &metadata)?;
    let columns = metadata
        .channels
        .iter()
        .map(|channel| channel.name.clone())
        .collect();
    let table = EventTable::new(columns, data).map_err(|e| Error::InvalidData(e.to_string()))?;
    Ok((metadata, table))
}

fn escape(value: &str) -> String {
    let delimiter = char::from(DELIMITER);
    value.replace(delimiter, &format!("{delimiter}{delimiter}"))
}

fn text_segment(keywords: &[(String, String)]) -> Vec<u8> {
    let mut text = vec![DELIMITER];
    for (keyword, value) in keywords {
        for token in [keyword, value] {
            text.extend_from_slice(escape(token).as_bytes());
            text.push(DELIMITER);
        }
    }
    text
}

fn header_offset(offset: usize) -> usize {
    if offset > MAX_HEADER_OFFSET {
        0
    } else {
        offset
    }
}

/// Write `table` to `path` as an FCS 3.1 file.
///
/// Instrument settings for each column are taken from the entry of `channels` with the same name.
/// Columns without an entry are written with only a name and range.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write(path: &Path, table: &EventTable, channels: &[ChannelInfo]) -> Result<()> {
    let mut keywords: Vec<(String, String)> = vec![
        ("$BYTEORD".into(), "1,2,3,4,5,6,7,8".into()),
        ("$DATATYPE".into(), "D".into()),
        ("$MODE".into(), "L".into()),
        ("$NEXTDATA".into(), "0".into()),
        ("$PAR".into(), table.columns().len().to_string()),
        ("$TOT".into(), table.len().to_string()),
        ("$BEGINANALYSIS".into(), "0".into()),
        ("$ENDANALYSIS".into(), "0".into()),
        ("$BEGINSTEXT".into(), "0".into()),
        ("$ENDSTEXT".into(), "0".into()),
    ];
    for (idx, column) in table.columns().iter().enumerate() {
        let n = idx + 1;
        let info = channels.iter().find(|info| &info.name == column);
        let pnn = info.map_or(column.as_str(), |info| info.pnn.as_str());
        keywords.push((format!("$P{n}N"), pnn.to_owned()));
        keywords.push((format!("$P{n}B"), "64".into()));
        keywords.push((format!("$P{n}E"), "0,0".into()));
        let range = info.and_then(|info| info.range).unwrap_or(DEFAULT_RANGE);
        keywords.push((format!("$P{n}R"), range.to_string()));
        if let Some(info) = info {
            if let Some(pns) = info.pns.as_ref().filter(|pns| !pns.is_empty()) {
                keywords.push((format!("$P{n}S"), pns.clone()));
            }
            if let Some(voltage) = info.voltage {
                keywords.push((format!("$P{n}V"), voltage.to_string()));
            }
            if let Some(gain) = info.gain {
                keywords.push((format!("$P{n}G"), gain.to_string()));
            }
        }
    }

    // Fixed width values so the segment length does not depend on where the data lands
    let data_len = table.len() * table.columns().len() * 8;
    let placeholder = |keywords: &mut Vec<(String, String)>, begin: usize, end: usize| {
        keywords.push(("$BEGINDATA".into(), format!("{begin:020}")));
        keywords.push(("$ENDDATA".into(), format!("{end:020}")));
    };
    let mut sized = keywords.clone();
    placeholder(&mut sized, 0, 0);
    let text_len = text_segment(&sized).len();

    let text_begin = HEADER_LEN;
    let text_end = text_begin + text_len - 1;
    let (data_begin, data_end) = if data_len == 0 {
        (0, 0)
    } else {
        (text_end + 1, text_end + data_len)
    };
    placeholder(&mut keywords, data_begin, data_end);
    let text = text_segment(&keywords);

    let mut writer = BufWriter::new(File::create(path)?);
    write!(
        writer,
        "FCS3.1    {:>8}{:>8}{:>8}{:>8}{:>8}{:>8}",
        text_begin,
        text_end,
        header_offset(data_begin),
        header_offset(data_end),
        0,
        0
    )?;
    writer.write_all(&text)?;
    for value in table.data() {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}
