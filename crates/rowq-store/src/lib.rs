//! Backend contract for sheet-shaped storage.
//!
//! The worker runtime coordinates exclusively through a spreadsheet whose
//! only primitives are range reads, range writes, and row appends. This
//! crate pins that surface down as [SheetStore] so the runtime never sees a
//! concrete backend, and ships [InMemorySheetStore] for tests, demos, and
//! embedding programs that have not wired a real spreadsheet yet.
//!
//! **Constraints (must hold in all implementations):**
//! - Every trait call maps to one backend request; there are no partial
//!   writes within a call.
//! - Row indices are 1-based and include the header row, matching the
//!   spreadsheet convention.
//! - `clear_row` blanks cells in place instead of removing the row, so
//!   concurrent readers never see row indices shift under them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Backend failure classes.
///
/// Implementations classify raw backend errors into these variants; the
/// runtime's gateway decides retry behavior from the variant alone.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Quota denial, 5xx, timeout, connection reset. Safe to retry.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The named sheet does not exist in the workbook.
    #[error("sheet not found: {0}")]
    SheetNotFound(String),
    /// Auth failure, malformed range, or any other non-retryable error.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

/// One workbook of named sheets, each a grid of string cells.
///
/// Row 1 is the header row. All methods are callable from multiple threads;
/// implementations serialize internally as needed, but callers should not
/// rely on any cross-call atomicity beyond the single-call guarantee.
pub trait SheetStore: Send + Sync {
    /// Reads every row of a sheet, header included, in sheet order.
    fn read_all(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError>;

    /// Reads a single row. Rows past the end come back empty rather than
    /// as an error, the way a spreadsheet range read behaves.
    fn read_row(&self, sheet: &str, row_number: usize) -> Result<Vec<String>, StoreError>;

    /// Appends one row after the last non-empty row.
    fn append_row(&self, sheet: &str, row: &[String]) -> Result<(), StoreError>;

    /// Appends several rows in one backend request.
    fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError>;

    /// Replaces the contents of one row.
    fn update_row(&self, sheet: &str, row_number: usize, row: &[String]) -> Result<(), StoreError>;

    /// Blanks every cell of one row, leaving the row in place.
    fn clear_row(&self, sheet: &str, row_number: usize) -> Result<(), StoreError>;

    /// Creates an empty sheet. Succeeds without effect if it already exists.
    fn create_sheet(&self, sheet: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Workbook {
    sheets: HashMap<String, Vec<Vec<String>>>,
    injected_errors: Vec<StoreError>,
    op_count: u64,
}

/// In-process [SheetStore] backed by a mutex-guarded map of sheets.
///
/// Clones share the same workbook, so several workers constructed from
/// clones of one store coordinate through shared state exactly as they
/// would through a real spreadsheet. Tests can stage failures with
/// [InMemorySheetStore::inject_error]; staged errors are returned by the
/// next operations in FIFO order before normal behavior resumes.
#[derive(Clone, Default)]
pub struct InMemorySheetStore {
    inner: Arc<Mutex<Workbook>>,
}

impl InMemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an error to be returned by an upcoming operation.
    pub fn inject_error(&self, error: StoreError) {
        if let Ok(mut wb) = self.inner.lock() {
            wb.injected_errors.push(error);
        }
    }

    /// Number of operations served so far, staged failures included.
    pub fn op_count(&self) -> u64 {
        self.inner.lock().map(|wb| wb.op_count).unwrap_or(0)
    }

    fn with_workbook<T>(
        &self,
        f: impl FnOnce(&mut Workbook) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut wb = self
            .inner
            .lock()
            .map_err(|_| StoreError::Permanent("workbook lock poisoned".to_string()))?;
        wb.op_count += 1;
        if !wb.injected_errors.is_empty() {
            return Err(wb.injected_errors.remove(0));
        }
        f(&mut wb)
    }
}

fn sheet_mut<'a>(wb: &'a mut Workbook, sheet: &str) -> Result<&'a mut Vec<Vec<String>>, StoreError> {
    wb.sheets
        .get_mut(sheet)
        .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))
}

impl SheetStore for InMemorySheetStore {
    fn read_all(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        self.with_workbook(|wb| {
            wb.sheets
                .get(sheet)
                .cloned()
                .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))
        })
    }

    fn read_row(&self, sheet: &str, row_number: usize) -> Result<Vec<String>, StoreError> {
        if row_number == 0 {
            return Err(StoreError::Permanent("row numbers are 1-based".to_string()));
        }
        self.with_workbook(|wb| {
            let rows = wb
                .sheets
                .get(sheet)
                .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))?;
            Ok(rows.get(row_number - 1).cloned().unwrap_or_default())
        })
    }

    fn append_row(&self, sheet: &str, row: &[String]) -> Result<(), StoreError> {
        self.with_workbook(|wb| {
            sheet_mut(wb, sheet)?.push(row.to_vec());
            Ok(())
        })
    }

    fn append_rows(&self, sheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.with_workbook(|wb| {
            sheet_mut(wb, sheet)?.extend(rows.iter().cloned());
            Ok(())
        })
    }

    fn update_row(&self, sheet: &str, row_number: usize, row: &[String]) -> Result<(), StoreError> {
        if row_number == 0 {
            return Err(StoreError::Permanent("row numbers are 1-based".to_string()));
        }
        self.with_workbook(|wb| {
            let rows = sheet_mut(wb, sheet)?;
            if row_number > rows.len() {
                rows.resize(row_number, Vec::new());
            }
            rows[row_number - 1] = row.to_vec();
            Ok(())
        })
    }

    fn clear_row(&self, sheet: &str, row_number: usize) -> Result<(), StoreError> {
        if row_number == 0 {
            return Err(StoreError::Permanent("row numbers are 1-based".to_string()));
        }
        self.with_workbook(|wb| {
            let rows = sheet_mut(wb, sheet)?;
            if let Some(row) = rows.get_mut(row_number - 1) {
                for cell in row.iter_mut() {
                    cell.clear();
                }
            }
            Ok(())
        })
    }

    fn create_sheet(&self, sheet: &str) -> Result<(), StoreError> {
        self.with_workbook(|wb| {
            wb.sheets.entry(sheet.to_string()).or_default();
            Ok(())
        })
    }
}
