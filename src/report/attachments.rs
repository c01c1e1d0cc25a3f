//! Report attachment dumps
//!
//! Writes the reported event subset to disk as a pretty-printed JSON dump
//! and a semicolon-delimited CSV dump, each optionally zip-compressed. The
//! CSV layout is a legacy format kept for compatibility with existing
//! downstream readers: fixed column order, missing values as literal `-`.

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::WardenResult;
use crate::models::Event;

/// CSV columns in their fixed legacy order.
const CSV_COLUMNS: [&str; 17] = [
    "date_gmt",
    "detected_gmt",
    "analyzer",
    "detector",
    "classification",
    "categories",
    "src_ip",
    "src_host",
    "src_port",
    "tgt_port",
    "src_proto",
    "tgt_proto",
    "con_cnt",
    "date_ts",
    "detected_ts",
    "note",
    "impact",
];

/// Dump written to disk: the plain file and, when compression is on, the
/// zip archive next to it.
#[derive(Debug, Clone)]
pub struct AttachmentDump {
    pub path: PathBuf,
    pub zip_path: Option<PathBuf>,
}

impl AttachmentDump {
    /// The file to attach: the archive when present, else the plain dump.
    pub fn attachable(&self) -> &Path {
        self.zip_path.as_deref().unwrap_or(&self.path)
    }
}

/// Write the event batch as a pretty-printed JSON dump.
pub fn save_json_dump(
    events: &[Event],
    directory: &Path,
    filename: &str,
    compress: bool,
) -> WardenResult<AttachmentDump> {
    fs::create_dir_all(directory)?;
    let path = directory.join(filename);
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(file, events)?;

    let zip_path = if compress {
        Some(zip_file(&path, filename)?)
    } else {
        None
    };
    Ok(AttachmentDump { path, zip_path })
}

/// Write the event batch as a semicolon-delimited CSV dump.
pub fn save_csv_dump(
    events: &[Event],
    directory: &Path,
    filename: &str,
    compress: bool,
) -> WardenResult<AttachmentDump> {
    fs::create_dir_all(directory)?;
    let path = directory.join(filename);
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_path(&path)?;
    writer.write_record(CSV_COLUMNS)?;
    for event in events {
        writer.write_record(csv_record(event))?;
    }
    writer.flush()?;

    let zip_path = if compress {
        Some(zip_file(&path, filename)?)
    } else {
        None
    };
    Ok(AttachmentDump { path, zip_path })
}

/// Keep attachment files until their aggregate size exceeds the limit
/// (0 = unlimited). Oversized tails are dropped with a warning.
pub fn choose_attachments(candidates: Vec<PathBuf>, max_size: u64) -> Vec<PathBuf> {
    if max_size == 0 {
        return candidates;
    }
    let mut result = Vec::new();
    let mut total = 0u64;
    for path in candidates {
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        total += meta.len();
        if total > max_size {
            warn!(
                target: "report",
                file = %path.display(),
                limit = max_size,
                "Attachment too big for the report, size limit would be exceeded"
            );
            break;
        }
        result.push(path);
    }
    result
}

fn zip_file(path: &Path, entry_name: &str) -> WardenResult<PathBuf> {
    let zip_path = PathBuf::from(format!("{}.zip", path.display()));
    let mut archive = zip::ZipWriter::new(File::create(&zip_path)?);
    archive.start_file(entry_name, zip::write::SimpleFileOptions::default())?;
    archive.write_all(&fs::read(path)?)?;
    archive.finish()?;
    Ok(zip_path)
}

/// Flatten selected event attributes into the legacy CSV row.
fn csv_record(event: &Event) -> Vec<String> {
    let detect = event.detect_time;
    let create = event.create_time.unwrap_or(detect);

    vec![
        format_gmt(create),
        format_gmt(detect),
        dash_if_empty(event.analyzer_software().first().cloned()),
        dash_if_empty(event.detector_name().map(str::to_string)),
        dash_if_empty(
            event
                .description
                .clone()
                .or_else(|| event.note.clone()),
        ),
        joined_or_dash(&event.category),
        joined_or_dash(&event.source_addresses()),
        "-".to_string(),
        joined_or_dash(&collect_ports(event, true)),
        joined_or_dash(&collect_ports(event, false)),
        joined_or_dash(&collect_protos(event, true)),
        joined_or_dash(&collect_protos(event, false)),
        dash_if_empty(event.conn_count.map(|c| c.to_string())),
        create.timestamp().to_string(),
        detect.timestamp().to_string(),
        dash_if_empty(event.note.clone()),
        dash_if_empty(event.ext.impact.clone()),
    ]
}

fn format_gmt(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn dash_if_empty(value: Option<String>) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => "-".to_string(),
    }
}

fn joined_or_dash(values: &[String]) -> String {
    if values.is_empty() {
        "-".to_string()
    } else {
        values.join(",")
    }
}

fn collect_ports(event: &Event, source: bool) -> Vec<String> {
    let endpoints = if source { &event.source } else { &event.target };
    endpoints
        .iter()
        .flat_map(|e| e.port.iter().map(u16::to_string))
        .collect()
}

fn collect_protos(event: &Event, source: bool) -> Vec<String> {
    let endpoints = if source { &event.source } else { &event.target };
    endpoints
        .iter()
        .flat_map(|e| e.proto.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectorNode, EventEndpoint, ExtensionFields};

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("warden-attachments-{}", std::process::id()))
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn sample_event() -> Event {
        Event {
            id: "ev-01".to_string(),
            detect_time: "2021-01-05T10:00:07Z".parse().unwrap(),
            create_time: Some("2021-01-05T10:00:02Z".parse().unwrap()),
            event_time: None,
            cease_time: None,
            category: vec!["Recon.Scanning".to_string()],
            description: Some("Port scanning".to_string()),
            note: None,
            source: vec![EventEndpoint {
                ip4: vec!["192.0.2.1".to_string()],
                port: vec![56_789],
                proto: vec!["tcp".to_string()],
                ..Default::default()
            }],
            target: vec![EventEndpoint {
                port: vec![22],
                proto: vec!["tcp".to_string(), "ssh".to_string()],
                ..Default::default()
            }],
            node: vec![DetectorNode {
                name: Some("org.example.kippo".to_string()),
                software: vec!["Kippo".to_string()],
            }],
            conn_count: Some(4),
            flow_count: None,
            packet_count: None,
            byte_count: None,
            ext: ExtensionFields::default(),
        }
    }

    #[test]
    fn csv_dump_has_fixed_layout_and_dash_placeholders() {
        let dir = test_dir("csv");
        let dump = save_csv_dump(&[sample_event()], &dir, "report.csv", false).unwrap();
        assert!(dump.zip_path.is_none());

        let content = fs::read_to_string(&dump.path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next().unwrap(),
            "date_gmt;detected_gmt;analyzer;detector;classification;categories;src_ip;\
             src_host;src_port;tgt_port;src_proto;tgt_proto;con_cnt;date_ts;detected_ts;\
             note;impact"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2021-01-05 10:00:02;2021-01-05 10:00:07;Kippo;org.example.kippo;\
             Port scanning;Recon.Scanning;192.0.2.1;-;56789;22;tcp;tcp,ssh;4;\
             1609840802;1609840807;-;-"
        );
    }

    #[test]
    fn json_dump_round_trips() {
        let dir = test_dir("json");
        let dump = save_json_dump(&[sample_event()], &dir, "report.json", false).unwrap();
        let parsed: Vec<Event> =
            serde_json::from_str(&fs::read_to_string(&dump.path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "ev-01");
    }

    #[test]
    fn compressed_dumps_produce_archives() {
        let dir = test_dir("zip");
        let dump = save_json_dump(&[sample_event()], &dir, "report.json", true).unwrap();
        let zip_path = dump.zip_path.clone().unwrap();
        assert!(zip_path.ends_with("report.json.zip"));
        assert!(zip_path.exists());
        assert_eq!(dump.attachable(), zip_path.as_path());

        let archive = zip::ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn attachment_choice_respects_size_limit() {
        let dir = test_dir("limit");
        fs::create_dir_all(&dir).unwrap();
        let small = dir.join("small.txt");
        let big = dir.join("big.txt");
        fs::write(&small, vec![0u8; 10]).unwrap();
        fs::write(&big, vec![0u8; 1000]).unwrap();

        let chosen = choose_attachments(vec![small.clone(), big.clone()], 100);
        assert_eq!(chosen, vec![small.clone()]);

        let unlimited = choose_attachments(vec![small.clone(), big.clone()], 0);
        assert_eq!(unlimited.len(), 2);
    }
}
