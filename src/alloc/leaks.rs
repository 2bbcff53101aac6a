//! Leak reports: everything still in the registry was never freed.

use std::{fs::File, io::BufWriter, path::Path};

use hashbrown::HashMap;
use log::Level;
use serde::Serialize;

use super::record::{RecordSnapshot, Site};
use crate::{error::Result, serialize::serde_addr, sink::SinkWriter, stack::StackInspector};

/// Where a record came from, resolved as far as the inspector can manage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Attribution {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub module: Option<String>,
}

impl Attribution {
    /// Resolve `record`. A site supplied by the caller wins over anything
    /// recovered from the stack.
    pub fn of<I: StackInspector + ?Sized>(inspector: &I, record: &RecordSnapshot) -> Self {
        let frame = match record.site {
            Site::Caller(address) => inspector.attribute(&[address]),
            _ => inspector.attribute(record.frames()),
        };
        let module = inspector
            .module_of(record.module_base)
            .filter(|_| record.module_base != 0)
            .map(|m| m.name.as_str().to_owned())
            .or_else(|| frame.as_ref().and_then(|f| f.module_name.clone()));
        let (file, line) = match record.site.file_line() {
            Some((file, line)) => (Some(file.to_owned()), Some(line)),
            None => (
                frame.as_ref().and_then(|f| f.file_name.clone()),
                frame.as_ref().and_then(|f| f.line_number),
            ),
        };
        Self {
            file,
            line,
            function: frame.and_then(|f| f.symbol_name),
            module,
        }
    }

    /// `file:line`, or the raw site if nothing resolved
    pub fn location(&self, site: &Site) -> String {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            (Some(file), None) => file.clone(),
            _ => site.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LeakEntry {
    pub serial: u64,
    #[serde(with = "serde_addr")]
    pub address: usize,
    pub size: usize,
    pub is_array: bool,
    pub project: String,
    pub thread: u64,
    pub location: String,
    #[serde(flatten)]
    pub attribution: Attribution,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProjectLeaks {
    pub project: String,
    pub count: usize,
    pub bytes: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct LeakReport {
    pub count: usize,
    pub total_bytes: usize,
    pub entries: Vec<LeakEntry>,
    /// Per project, most leaked bytes first
    pub projects: Vec<ProjectLeaks>,
}

impl LeakReport {
    pub fn build<I: StackInspector + ?Sized>(inspector: &I, records: &[RecordSnapshot]) -> Self {
        let entries: Vec<LeakEntry> = records
            .iter()
            .map(|record| {
                let attribution = Attribution::of(inspector, record);
                LeakEntry {
                    serial: record.serial,
                    address: record.address,
                    size: record.size,
                    is_array: record.is_array,
                    project: record.project.as_str().to_owned(),
                    thread: record.thread,
                    location: attribution.location(&record.site),
                    attribution,
                }
            })
            .collect();

        let mut by_project: HashMap<&str, (usize, usize)> = HashMap::new();
        for entry in &entries {
            let totals = by_project.entry(entry.project.as_str()).or_default();
            totals.0 += 1;
            totals.1 += entry.size;
        }
        let mut projects: Vec<ProjectLeaks> = by_project
            .into_iter()
            .map(|(project, (count, bytes))| ProjectLeaks {
                project: project.to_owned(),
                count,
                bytes,
            })
            .collect();
        projects.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.project.cmp(&b.project)));

        Self {
            count: entries.len(),
            total_bytes: entries.iter().map(|e| e.size).sum(),
            entries,
            projects,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The textual report.
    pub fn write_to(&self, w: &mut SinkWriter<'_>) {
        if self.is_empty() {
            w.line(Level::Info, format_args!("memwatch: no memory leaks detected"));
            return;
        }
        w.line(
            Level::Warn,
            format_args!(
                "memwatch: {} memory leak(s) detected, {} byte(s) total",
                self.count, self.total_bytes
            ),
        );
        for entry in &self.entries {
            w.line(
                Level::Warn,
                format_args!(
                    "  #{} {} {:#x} {} byte(s){} allocated at {} [{}] in {}",
                    entry.serial,
                    entry.project,
                    entry.address,
                    entry.size,
                    if entry.is_array { " (array)" } else { "" },
                    entry.location,
                    entry.attribution.module.as_deref().unwrap_or("?"),
                    entry.attribution.function.as_deref().unwrap_or("?"),
                ),
            );
        }
        w.line(Level::Warn, format_args!("  by project:"));
        for project in &self.projects {
            w.line(
                Level::Warn,
                format_args!(
                    "    {}: {} leak(s), {} byte(s)",
                    project.project, project.count, project.bytes
                ),
            );
        }
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc::record::ProjectTag, config::MAX_STACK_DEPTH, stack::NullInspector};

    fn leak(serial: u64, project: &str, size: usize, site: Site) -> RecordSnapshot {
        RecordSnapshot {
            address: 0x1000 * serial as usize,
            size,
            is_array: false,
            serial,
            thread: 1,
            project: ProjectTag::new(project),
            site,
            module_base: 0,
            frames: [0; MAX_STACK_DEPTH],
            frame_count: 0,
            magic: 0,
        }
    }

    #[test]
    fn report_aggregates_by_project() {
        let records = [
            leak(1, "demo", 64, Site::Source { file: "src/demo.rs", line: 3 }),
            leak(2, "other", 10, Site::Unknown),
            leak(3, "demo", 6, Site::Caller(0xabc)),
        ];
        let report = LeakReport::build(&NullInspector, &records);
        assert_eq!(report.count, 3);
        assert_eq!(report.total_bytes, 80);
        assert_eq!(
            report.projects,
            [
                ProjectLeaks { project: "demo".into(), count: 2, bytes: 70 },
                ProjectLeaks { project: "other".into(), count: 1, bytes: 10 },
            ]
        );
        assert_eq!(report.entries[0].location, "src/demo.rs:3");
        assert_eq!(report.entries[1].location, "<unknown>");
        assert_eq!(report.entries[2].location, "0xabc");
    }

    #[test]
    fn report_serialises_addresses_as_hex() {
        let records = [leak(2, "demo", 64, Site::Unknown)];
        let json = serde_json::to_value(LeakReport::build(&NullInspector, &records)).unwrap();
        assert_eq!(json["entries"][0]["address"], "0x2000");
        assert_eq!(json["entries"][0]["project"], "demo");
        assert_eq!(json["projects"][0]["bytes"], 64);
    }
}
