//! CSV workbook: a directory with one `<target>.csv` sheet per class.

use rollcall_core::{AttendanceRecord, AttendanceSink, SinkError};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

const SHEET_EXTENSION: &str = "csv";
const HEADER: [&str; 4] = ["identity", "date", "time", "status"];

/// Handle on the workbook directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Workbook {
    dir: PathBuf,
}

impl Workbook {
    pub fn open(dir: &Path) -> Result<Self, SinkError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Sorted sheet names.
    pub fn targets(&self) -> Result<Vec<String>, SinkError> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == SHEET_EXTENSION))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sheet_path(name).is_ok_and(|p| p.is_file())
    }

    /// Create an empty sheet with a header row. Returns `false` if it
    /// already exists.
    pub fn create_target(&self, name: &str) -> Result<bool, SinkError> {
        let path = self.sheet_path(name)?;
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER).map_err(csv_error)?;
        writer.flush()?;
        tracing::info!(sheet = name, path = %path.display(), "attendance sheet created");
        Ok(true)
    }

    fn sheet_path(&self, name: &str) -> Result<PathBuf, SinkError> {
        let valid = !name.trim().is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(SinkError::TargetNotFound(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.{SHEET_EXTENSION}")))
    }
}

/// [`AttendanceSink`] appending rows to the selected sheet.
pub struct WorkbookSink {
    book: Workbook,
    selected: Option<PathBuf>,
}

impl WorkbookSink {
    pub fn new(book: Workbook) -> Self {
        Self {
            book,
            selected: None,
        }
    }
}

impl AttendanceSink for WorkbookSink {
    fn select_target(&mut self, name: &str) -> Result<(), SinkError> {
        let path = self.book.sheet_path(name)?;
        if !path.is_file() {
            return Err(SinkError::TargetNotFound(name.to_string()));
        }
        self.selected = Some(path);
        Ok(())
    }

    fn append_record(&mut self, record: &AttendanceRecord) -> Result<(), SinkError> {
        let path = self.selected.as_ref().ok_or(SinkError::NoTarget)?;
        // The sheet may have been deleted behind our back; do not recreate it.
        let file = OpenOptions::new().append(true).open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SinkError::Unavailable(format!("sheet {} disappeared", path.display()))
            } else {
                e.into()
            }
        })?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record([
                record.identity.as_str(),
                record.date.as_str(),
                record.time.as_str(),
                record.status.as_str(),
            ])
            .map_err(csv_error)?;
        writer.flush()?;
        Ok(())
    }
}

fn csv_error(e: csv::Error) -> SinkError {
    SinkError::Unavailable(e.to_string())
}
