//! Coverage-track data model and the line-oriented track format.
//!
//! A track is a header followed by tab-delimited rows, one per constant
//! coverage run: contig, start, end, coverage, high-MAPQ coverage,
//! high-clipping coverage, annotation bitset, region index and, when the
//! header declares them, truth and prediction labels. Files ending in `.gz`
//! are gzip-compressed.

use crate::error::{Error, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Per-window coverage measurements with annotation and label context.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CoverageInfo {
    /// Total read coverage.
    pub coverage: u32,
    /// Coverage restricted to high-MAPQ alignments.
    pub high_mapq_coverage: u32,
    /// Coverage restricted to highly clipped alignments.
    pub high_clip_coverage: u32,
    /// Bitset of overlapping annotations, one bit per annotation index.
    pub annotation_flags: u32,
    /// Region class selecting the emission/transition set.
    pub region_index: usize,
    /// Truth label, if the track carries one.
    pub truth_label: Option<u8>,
    /// Prediction label, if the track carries one.
    pub prediction_label: Option<u8>,
}

impl CoverageInfo {
    /// Returns whether annotation `index` overlaps this window.
    #[must_use]
    pub const fn overlaps_annotation(&self, index: usize) -> bool {
        (self.annotation_flags >> index) & 1 == 1
    }

    /// Returns whether this window belongs to region `index`.
    #[must_use]
    pub const fn overlaps_region(&self, index: usize) -> bool {
        self.region_index == index
    }

    /// Fraction of the coverage coming from high-MAPQ alignments.
    #[must_use]
    pub fn high_mapq_ratio(&self) -> f64 {
        f64::from(self.high_mapq_coverage) / (0.1 + f64::from(self.coverage))
    }

    /// Fraction of the coverage coming from highly clipped alignments.
    #[must_use]
    pub fn high_clip_ratio(&self) -> f64 {
        f64::from(self.high_clip_coverage) / (0.1 + f64::from(self.coverage))
    }
}

/// One constant-coverage run on a contig; coordinates are 1-based and
/// inclusive on both ends.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackBlock {
    /// Start of the run.
    pub start: u64,
    /// Inclusive end of the run.
    pub end: u64,
    /// Measurements of the run.
    pub info: CoverageInfo,
}

impl TrackBlock {
    /// Length of the run in bases.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Runs are never empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// All runs of one contig, in coordinate order.
#[derive(Clone, Debug)]
pub struct ContigBlocks {
    /// Contig name.
    pub contig: String,
    /// Runs in coordinate order.
    pub blocks: Vec<TrackBlock>,
}

/// Header of a coverage track.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CoverageHeader {
    /// Annotation names, indexed by annotation bit.
    pub annotation_names: Vec<String>,
    /// Expected reference coverage per region.
    pub region_coverages: Vec<u32>,
    /// Number of labels, including the reserved unknown label.
    pub num_labels: usize,
    /// Whether rows carry a truth-label column.
    pub is_truth_available: bool,
    /// Whether rows carry a prediction-label column.
    pub is_prediction_available: bool,
    /// Whether body coordinates are 0-based half-open instead of 1-based
    /// inclusive.
    pub zero_based: bool,
}

impl CoverageHeader {
    /// Returns the number of regions.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.region_coverages.len()
    }

    /// Returns the number of annotations.
    #[must_use]
    pub fn num_annotations(&self) -> usize {
        self.annotation_names.len()
    }

    /// Serializes the header lines.
    pub fn write_into(&self, writer: &mut impl Write) -> Result<()> {
        writeln!(writer, "#annotation:len:{}", self.annotation_names.len())?;
        for (index, name) in self.annotation_names.iter().enumerate() {
            writeln!(writer, "#annotation:{index}:{name}")?;
        }
        writeln!(writer, "#region:len:{}", self.region_coverages.len())?;
        for (index, coverage) in self.region_coverages.iter().enumerate() {
            writeln!(writer, "#region:coverage:{index}:{coverage}")?;
        }
        writeln!(writer, "#label:len:{}", self.num_labels)?;
        writeln!(writer, "#truth:{}", self.is_truth_available)?;
        writeln!(writer, "#prediction:{}", self.is_prediction_available)?;
        writeln!(writer, "#zero_based:{}", self.zero_based)?;
        Ok(())
    }

    fn parse_line(&mut self, line: &str, path: &str, line_no: usize) -> Result<()> {
        let body = &line[1..];
        let parse_err = |reason: String| Error::Parse {
            path: path.to_string(),
            line: line_no,
            reason,
        };
        let fields: Vec<&str> = body.split(':').collect();
        match fields.as_slice() {
            ["annotation", "len", n] => {
                let len: usize = n.parse().map_err(|_| parse_err(format!("bad count `{n}`")))?;
                self.annotation_names = vec![String::new(); len];
            }
            ["annotation", index, name] => {
                let index: usize = index
                    .parse()
                    .map_err(|_| parse_err(format!("bad annotation index `{index}`")))?;
                if index >= self.annotation_names.len() {
                    return Err(parse_err(format!("annotation index {index} out of range")));
                }
                self.annotation_names[index] = (*name).to_string();
            }
            ["region", "len", n] => {
                let len: usize = n.parse().map_err(|_| parse_err(format!("bad count `{n}`")))?;
                self.region_coverages = vec![0; len];
            }
            ["region", "coverage", index, coverage] => {
                let index: usize = index
                    .parse()
                    .map_err(|_| parse_err(format!("bad region index `{index}`")))?;
                if index >= self.region_coverages.len() {
                    return Err(parse_err(format!("region index {index} out of range")));
                }
                self.region_coverages[index] = coverage
                    .parse()
                    .map_err(|_| parse_err(format!("bad coverage `{coverage}`")))?;
            }
            ["label", "len", n] => {
                self.num_labels = n.parse().map_err(|_| parse_err(format!("bad count `{n}`")))?;
            }
            ["truth", flag] => {
                self.is_truth_available = flag
                    .parse()
                    .map_err(|_| parse_err(format!("bad boolean `{flag}`")))?;
            }
            ["prediction", flag] => {
                self.is_prediction_available = flag
                    .parse()
                    .map_err(|_| parse_err(format!("bad boolean `{flag}`")))?;
            }
            ["zero_based", flag] => {
                self.zero_based = flag
                    .parse()
                    .map_err(|_| parse_err(format!("bad boolean `{flag}`")))?;
            }
            _ => return Err(parse_err(format!("unrecognized header line `{line}`"))),
        }
        Ok(())
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Creates a plain or gzip-compressed writer based on the path extension.
pub fn open_writer(path: &Path) -> Result<Box<dyn Write>> {
    let file = File::create(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufWriter::new(GzEncoder::new(
            file,
            Compression::default(),
        ))))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Streaming reader over the blocks of a coverage track.
pub struct TrackReader {
    lines: Box<dyn BufRead>,
    header: CoverageHeader,
    path: String,
    line_no: usize,
    pending: Option<(String, TrackBlock)>,
}

impl TrackReader {
    /// Opens a track and parses its header; the header must precede every
    /// body line.
    pub fn open(path: &Path) -> Result<Self> {
        let mut lines = open_reader(path)?;
        let path_str = path.display().to_string();
        let mut header = CoverageHeader::default();
        let mut line_no = 0;
        let mut buffer = String::new();
        let mut pending = None;
        loop {
            buffer.clear();
            if lines.read_line(&mut buffer)? == 0 {
                break;
            }
            line_no += 1;
            let line = buffer.trim_end();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                header.parse_line(line, &path_str, line_no)?;
            } else {
                pending = Some(line.to_string());
                break;
            }
        }
        let mut reader = Self {
            lines,
            header,
            path: path_str,
            line_no,
            pending: None,
        };
        if let Some(line) = pending {
            // the first body line was already consumed while scanning the
            // header; stash its parse result
            reader.pending = Some(reader.parse_body_line(&line)?);
        }
        Ok(reader)
    }

    /// Returns the parsed header.
    #[must_use]
    pub const fn header(&self) -> &CoverageHeader {
        &self.header
    }

    fn parse_body_line(&self, line: &str) -> Result<(String, TrackBlock)> {
        let parse_err = |reason: String| Error::Parse {
            path: self.path.clone(),
            line: self.line_no,
            reason,
        };
        let fields: Vec<&str> = line.split('\t').collect();
        let mut expected = 8;
        if self.header.is_truth_available {
            expected += 1;
        }
        if self.header.is_prediction_available {
            expected += 1;
        }
        if fields.len() != expected {
            return Err(parse_err(format!(
                "expected {expected} columns, found {}",
                fields.len()
            )));
        }
        let contig = fields[0].to_string();
        let mut start: u64 = fields[1]
            .parse()
            .map_err(|_| parse_err(format!("bad start `{}`", fields[1])))?;
        let end: u64 = fields[2]
            .parse()
            .map_err(|_| parse_err(format!("bad end `{}`", fields[2])))?;
        if self.header.zero_based {
            start += 1;
        }
        let parse_u32 = |field: &str| -> Result<u32> {
            field
                .parse()
                .map_err(|_| parse_err(format!("bad integer `{field}`")))
        };
        let mut info = CoverageInfo {
            coverage: parse_u32(fields[3])?,
            high_mapq_coverage: parse_u32(fields[4])?,
            high_clip_coverage: parse_u32(fields[5])?,
            annotation_flags: parse_u32(fields[6])?,
            region_index: fields[7]
                .parse()
                .map_err(|_| parse_err(format!("bad region index `{}`", fields[7])))?,
            truth_label: None,
            prediction_label: None,
        };
        let mut next = 8;
        let parse_label = |field: &str| -> Result<Option<u8>> {
            if field == "-1" {
                return Ok(None);
            }
            field
                .parse()
                .map(Some)
                .map_err(|_| parse_err(format!("bad label `{field}`")))
        };
        if self.header.is_truth_available {
            info.truth_label = parse_label(fields[next])?;
            next += 1;
        }
        if self.header.is_prediction_available {
            info.prediction_label = parse_label(fields[next])?;
        }
        Ok((contig, TrackBlock { start, end, info }))
    }

    /// Returns the next block, or `None` at end of input.
    pub fn next_block(&mut self) -> Result<Option<(String, TrackBlock)>> {
        if let Some(block) = self.pending.take() {
            return Ok(Some(block));
        }
        let mut buffer = String::new();
        loop {
            buffer.clear();
            if self.lines.read_line(&mut buffer)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line = buffer.trim_end();
            if line.is_empty() {
                continue;
            }
            return self.parse_body_line(line).map(Some);
        }
    }
}

/// Reads a whole track into per-contig block lists.
pub fn read_contig_blocks(path: &Path) -> Result<(CoverageHeader, Vec<ContigBlocks>)> {
    let mut reader = TrackReader::open(path)?;
    let mut contigs: Vec<ContigBlocks> = Vec::new();
    while let Some((contig, block)) = reader.next_block()? {
        match contigs.last_mut() {
            Some(last) if last.contig == contig => last.blocks.push(block),
            _ => contigs.push(ContigBlocks {
                contig,
                blocks: vec![block],
            }),
        }
    }
    Ok((reader.header.clone(), contigs))
}

/// Writes a header and per-contig blocks as a track file.
pub fn write_track(
    writer: &mut impl Write,
    header: &CoverageHeader,
    contigs: &[ContigBlocks],
) -> Result<()> {
    header.write_into(writer)?;
    for contig in contigs {
        for block in &contig.blocks {
            let (start, end) = if header.zero_based {
                (block.start - 1, block.end)
            } else {
                (block.start, block.end)
            };
            write!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                contig.contig,
                start,
                end,
                block.info.coverage,
                block.info.high_mapq_coverage,
                block.info.high_clip_coverage,
                block.info.annotation_flags,
                block.info.region_index,
            )?;
            let label = |l: Option<u8>| l.map_or(-1, i64::from);
            if header.is_truth_available {
                write!(writer, "\t{}", label(block.info.truth_label))?;
            }
            if header.is_prediction_available {
                write!(writer, "\t{}", label(block.info.prediction_label))?;
            }
            writeln!(writer)?;
        }
    }
    Ok(())
}

/// A contiguous sequence of per-window observations for one contig stretch,
/// immutable after construction.
#[derive(Clone, Debug)]
pub struct Chunk {
    contig: String,
    window_len: u32,
    windows: Vec<(u64, u64)>,
    infos: Vec<CoverageInfo>,
}

impl Chunk {
    /// Returns the contig name.
    #[must_use]
    pub fn contig(&self) -> &str {
        &self.contig
    }

    /// Returns the window length in bases.
    #[must_use]
    pub const fn window_len(&self) -> u32 {
        self.window_len
    }

    /// Returns the per-window observations.
    #[must_use]
    pub fn infos(&self) -> &[CoverageInfo] {
        &self.infos
    }

    /// Returns the number of windows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Returns whether the chunk has no windows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the 1-based inclusive span of window `index`.
    #[must_use]
    pub fn window_span(&self, index: usize) -> (u64, u64) {
        self.windows[index]
    }
}

/// Splits per-contig blocks into fixed-window chunks of at most
/// `max_windows` observations each. A run shorter than the window length
/// keeps its own, shorter window.
#[must_use]
pub fn chunks_from_blocks(
    contigs: &[ContigBlocks],
    window_len: u32,
    max_windows: usize,
) -> Vec<Chunk> {
    debug_assert!(window_len > 0 && max_windows > 0);
    let mut chunks = Vec::new();
    for contig in contigs {
        let mut windows: Vec<(u64, u64)> = Vec::new();
        let mut infos: Vec<CoverageInfo> = Vec::new();
        for block in &contig.blocks {
            let mut pos = block.start;
            while pos <= block.end {
                let window_end = (pos + u64::from(window_len) - 1).min(block.end);
                windows.push((pos, window_end));
                infos.push(block.info);
                pos = window_end + 1;
                if infos.len() >= max_windows {
                    chunks.push(Chunk {
                        contig: contig.contig.clone(),
                        window_len,
                        windows: std::mem::take(&mut windows),
                        infos: std::mem::take(&mut infos),
                    });
                }
            }
        }
        if !infos.is_empty() {
            chunks.push(Chunk {
                contig: contig.contig.clone(),
                window_len,
                windows,
                infos,
            });
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> CoverageHeader {
        CoverageHeader {
            annotation_names: vec!["no_annotation".to_string(), "annotation_1".to_string()],
            region_coverages: vec![20, 40],
            num_labels: 5,
            is_truth_available: true,
            is_prediction_available: false,
            zero_based: false,
        }
    }

    fn test_blocks() -> Vec<ContigBlocks> {
        vec![
            ContigBlocks {
                contig: "ctg1".to_string(),
                blocks: vec![
                    TrackBlock {
                        start: 1,
                        end: 10,
                        info: CoverageInfo {
                            coverage: 4,
                            high_mapq_coverage: 4,
                            high_clip_coverage: 0,
                            annotation_flags: 1,
                            region_index: 0,
                            truth_label: Some(2),
                            prediction_label: None,
                        },
                    },
                    TrackBlock {
                        start: 11,
                        end: 30,
                        info: CoverageInfo {
                            coverage: 30,
                            high_mapq_coverage: 28,
                            high_clip_coverage: 1,
                            annotation_flags: 2,
                            region_index: 1,
                            truth_label: None,
                            prediction_label: None,
                        },
                    },
                ],
            },
            ContigBlocks {
                contig: "ctg2".to_string(),
                blocks: vec![TrackBlock {
                    start: 1,
                    end: 8,
                    info: CoverageInfo {
                        coverage: 8,
                        high_mapq_coverage: 8,
                        high_clip_coverage: 0,
                        annotation_flags: 1,
                        region_index: 0,
                        truth_label: Some(1),
                        prediction_label: None,
                    },
                }],
            },
        ]
    }

    #[test]
    fn header_round_trip() {
        let header = test_header();
        let mut buffer = Vec::new();
        header.write_into(&mut buffer).unwrap();

        let dir = std::env::temp_dir().join("covhmm-track-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("header_round_trip.cov");
        std::fs::write(&path, &buffer).unwrap();

        let reader = TrackReader::open(&path).unwrap();
        assert_eq!(*reader.header(), header);
    }

    #[test]
    fn track_round_trip() {
        let header = test_header();
        let blocks = test_blocks();
        let mut buffer = Vec::new();
        write_track(&mut buffer, &header, &blocks).unwrap();

        let dir = std::env::temp_dir().join("covhmm-track-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("track_round_trip.cov");
        std::fs::write(&path, &buffer).unwrap();

        let (parsed_header, parsed_blocks) = read_contig_blocks(&path).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_blocks.len(), 2);
        assert_eq!(parsed_blocks[0].blocks, blocks[0].blocks);
        assert_eq!(parsed_blocks[1].blocks, blocks[1].blocks);
    }

    #[test]
    fn gzip_round_trip() {
        let header = test_header();
        let blocks = test_blocks();

        let dir = std::env::temp_dir().join("covhmm-track-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("track_round_trip.cov.gz");
        {
            let mut writer = open_writer(&path).unwrap();
            write_track(&mut writer, &header, &blocks).unwrap();
        }

        let (parsed_header, parsed_blocks) = read_contig_blocks(&path).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_blocks[0].blocks, blocks[0].blocks);
    }

    #[test]
    fn chunks_split_per_contig_and_window() {
        let blocks = test_blocks();
        let chunks = chunks_from_blocks(&blocks, 10, 2);
        // ctg1 has 3 windows (10 + 20 bases at window 10) -> two chunks
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].contig(), "ctg1");
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].contig(), "ctg1");
        assert_eq!(chunks[1].len(), 1);
        assert_eq!(chunks[2].contig(), "ctg2");
        assert_eq!(chunks[2].len(), 1);
        assert_eq!(chunks[0].infos()[0].coverage, 4);
        assert_eq!(chunks[0].infos()[1].coverage, 30);
        assert_eq!(chunks[0].window_span(0), (1, 10));
        assert_eq!(chunks[0].window_span(1), (11, 20));
        assert_eq!(chunks[1].window_span(0), (21, 30));
    }
}
