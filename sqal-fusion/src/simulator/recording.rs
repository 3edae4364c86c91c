//! Recorded frame streams
//!
//! One JSON frame payload per line. Blank lines and lines starting with `#`
//! are skipped so recordings can carry notes.

use super::SimulatorError;
use sqal_common::types::FramePayload;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Parse a JSON-lines recording
pub fn parse_recording<R: BufRead>(reader: R) -> Result<Vec<FramePayload>, SimulatorError> {
    let mut frames = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let payload = serde_json::from_str(trimmed).map_err(|source| SimulatorError::Parse {
            line: index + 1,
            source,
        })?;
        frames.push(payload);
    }
    Ok(frames)
}

pub fn read_recording(path: &Path) -> Result<Vec<FramePayload>, SimulatorError> {
    let frames = parse_recording(BufReader::new(File::open(path)?))?;
    info!("Loaded {} frames from {}", frames.len(), path.display());
    Ok(frames)
}

pub fn write_recording<W: Write>(writer: W, frames: &[FramePayload]) -> Result<(), SimulatorError> {
    let mut writer = BufWriter::new(writer);
    for frame in frames {
        serde_json::to_writer(&mut writer, frame).map_err(SimulatorError::Serialize)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_recording(path: &Path, frames: &[FramePayload]) -> Result<(), SimulatorError> {
    write_recording(File::create(path)?, frames)?;
    info!("Recorded {} frames to {}", frames.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{FrameGenerator, QualityProfile};

    #[test]
    fn test_recording_file_preserves_frames() {
        let frames = FrameGenerator::seeded(QualityProfile::Good, 3).samples(2);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.jsonl");

        save_recording(&path, &frames).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);
        assert_eq!(read_recording(&path).unwrap(), frames);
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let frame = &FrameGenerator::seeded(QualityProfile::Good, 3).next_sample()[1];
        let text = format!(
            "# shift 2, line B\n\n{}\n",
            serde_json::to_string(frame).unwrap()
        );
        let frames = parse_recording(text.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let text = "# header\n{\"modality\":\"spectral\"\n";
        match parse_recording(text.as_bytes()) {
            Err(SimulatorError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
