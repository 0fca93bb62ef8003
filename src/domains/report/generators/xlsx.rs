use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Workbook, Worksheet};

use crate::domains::core::blob_storage_service::BlobStorageService;
use crate::domains::participation::{ParticipationRepository, ParticipationRow};
use crate::domains::report::types::ReportKind;

use super::{upload_rendered, GenerationError, ReportGenerator};

// Worksheet theme colors.
const COLOR_SUCCESS: u32 = 0x10B981;
const COLOR_INFO: u32 = 0x06B6D4;
const COLOR_WARNING: u32 = 0xF59E0B;
const COLOR_DANGER: u32 = 0xEF4444;
const COLOR_HEADER_BG: u32 = 0x1E293B;
const COLOR_TITLE_BG: u32 = 0x3B82F6;
const COLOR_ROW_EVEN: u32 = 0xF8FAFC;
const COLOR_SUBTITLE: u32 = 0x64748B;

const HEADERS: [(&str, f64); 9] = [
    ("Student", 28.0),
    ("Email", 32.0),
    ("Activity", 28.0),
    ("Kind", 15.0),
    ("Present", 12.0),
    ("Hours", 10.0),
    ("Score", 10.0),
    ("Grade", 12.0),
    ("Status", 18.0),
];

const HEADER_ROW: u32 = 2;
const FIRST_DATA_ROW: u32 = 3;
const LAST_COL: u16 = (HEADERS.len() - 1) as u16;

/// Streams class rows into a styled spreadsheet.
pub struct TabularXlsxGenerator {
    participation: Arc<dyn ParticipationRepository>,
    storage: Arc<dyn BlobStorageService>,
}

impl TabularXlsxGenerator {
    pub fn new(
        participation: Arc<dyn ParticipationRepository>,
        storage: Arc<dyn BlobStorageService>,
    ) -> Self {
        Self {
            participation,
            storage,
        }
    }
}

struct SheetFormats {
    text_odd: Format,
    text_even: Format,
    center_odd: Format,
    center_even: Format,
    number_odd: Format,
    number_even: Format,
    score_success: Format,
    score_info: Format,
    score_warning: Format,
    score_danger: Format,
    grade_neutral: Format,
    status_approved: Format,
    status_pending: Format,
    status_failed: Format,
}

impl SheetFormats {
    fn new() -> Self {
        let base = Format::new().set_border(FormatBorder::Thin);
        let center = base.clone().set_align(FormatAlign::Center);
        let even = |f: &Format| f.clone().set_background_color(Color::RGB(COLOR_ROW_EVEN));
        let score = |color: u32| center.clone().set_bold().set_font_color(Color::RGB(color));
        let status = |font: u32, fill: u32| {
            center
                .clone()
                .set_bold()
                .set_font_color(Color::RGB(font))
                .set_background_color(Color::RGB(fill))
        };

        Self {
            text_even: even(&base),
            center_even: even(&center),
            number_even: even(&center.clone().set_num_format("0.00")),
            text_odd: base.clone(),
            center_odd: center.clone(),
            number_odd: center.clone().set_num_format("0.00"),
            score_success: score(COLOR_SUCCESS),
            score_info: score(COLOR_INFO),
            score_warning: score(COLOR_WARNING),
            score_danger: score(COLOR_DANGER),
            grade_neutral: center.clone().set_bold(),
            status_approved: status(COLOR_SUCCESS, 0xD1FAE5),
            status_pending: status(COLOR_WARNING, 0xFEF3C7),
            status_failed: status(COLOR_DANGER, 0xFECACA),
        }
    }

    /// Score cells are colored by band: 9+ excellent, 7+ good, 5+ passing,
    /// anything above zero failing.
    fn score_format(&self, score: f64) -> &Format {
        if score >= 9.0 {
            &self.score_success
        } else if score >= 7.0 {
            &self.score_info
        } else if score >= 5.0 {
            &self.score_warning
        } else {
            &self.score_danger
        }
    }

    fn grade_format(&self, grade: &str) -> &Format {
        match grade.to_uppercase().as_str() {
            "A" | "EXCELLENT" => &self.score_success,
            "B" | "GOOD" => &self.score_info,
            "C" | "AVERAGE" => &self.score_warning,
            "D" | "F" | "INSUFFICIENT" => &self.score_danger,
            _ => &self.grade_neutral,
        }
    }

    fn status_format(&self, status: &str) -> Option<&Format> {
        let status = status.to_lowercase();
        if status.contains("approved") || status.contains("completed") {
            Some(&self.status_approved)
        } else if status.contains("pending") || status.contains("in progress") {
            Some(&self.status_pending)
        } else if status.contains("failed") || status.contains("absent") {
            Some(&self.status_failed)
        } else {
            None
        }
    }
}

fn write_title_block(
    sheet: &mut Worksheet,
    class_id: &str,
) -> Result<(), rust_xlsxwriter::XlsxError> {
    let title_format = Format::new()
        .set_bold()
        .set_font_size(18)
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(COLOR_TITLE_BG))
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter);
    let subtitle_format = Format::new()
        .set_italic()
        .set_font_size(11)
        .set_font_color(Color::RGB(COLOR_SUBTITLE))
        .set_align(FormatAlign::Center);
    let header_format = Format::new()
        .set_bold()
        .set_font_size(11)
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(COLOR_HEADER_BG))
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter)
        .set_border(FormatBorder::Thin);

    sheet.merge_range(
        0,
        0,
        0,
        LAST_COL,
        &format!("Participation report - class {}", class_id),
        &title_format,
    )?;
    sheet.set_row_height(0, 28)?;

    sheet.merge_range(
        1,
        0,
        1,
        LAST_COL,
        &format!(
            "Generated at {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
        ),
        &subtitle_format,
    )?;
    sheet.set_row_height(1, 18)?;

    for (index, (header, width)) in HEADERS.iter().enumerate() {
        let col = index as u16;
        sheet.set_column_width(col, *width)?;
        sheet.write_string_with_format(HEADER_ROW, col, *header, &header_format)?;
    }
    sheet.set_row_height(HEADER_ROW, 24)?;
    sheet.set_freeze_panes(FIRST_DATA_ROW, 0)?;

    Ok(())
}

fn write_data_row(
    sheet: &mut Worksheet,
    formats: &SheetFormats,
    row_index: u32,
    row: &ParticipationRow,
) -> Result<(), rust_xlsxwriter::XlsxError> {
    let even = (row_index - FIRST_DATA_ROW) % 2 == 1;
    let text = if even {
        &formats.text_even
    } else {
        &formats.text_odd
    };
    let center = if even {
        &formats.center_even
    } else {
        &formats.center_odd
    };
    let number = if even {
        &formats.number_even
    } else {
        &formats.number_odd
    };

    sheet.write_string_with_format(row_index, 0, &row.student_name, text)?;
    sheet.write_string_with_format(row_index, 1, row.student_email.as_deref().unwrap_or(""), text)?;
    sheet.write_string_with_format(row_index, 2, &row.activity_name, text)?;
    sheet.write_string_with_format(row_index, 3, row.activity_kind.as_deref().unwrap_or(""), center)?;
    sheet.write_string_with_format(
        row_index,
        4,
        if row.present { "yes" } else { "no" },
        center,
    )?;

    match row.hours {
        Some(hours) => sheet.write_number_with_format(row_index, 5, hours, number)?,
        None => sheet.write_string_with_format(row_index, 5, "", center)?,
    };

    match row.score {
        Some(score) => {
            let format = formats.score_format(score).clone().set_num_format("0.00");
            sheet.write_number_with_format(row_index, 6, score, &format)?
        }
        None => sheet.write_string_with_format(row_index, 6, "", center)?,
    };

    match row.grade.as_deref() {
        Some(grade) => {
            sheet.write_string_with_format(row_index, 7, grade, formats.grade_format(grade))?
        }
        None => sheet.write_string_with_format(row_index, 7, "", center)?,
    };

    match row.evaluation_status.as_deref() {
        Some(status) => {
            let format = formats.status_format(status).unwrap_or(center);
            sheet.write_string_with_format(row_index, 8, status, format)?
        }
        None => sheet.write_string_with_format(row_index, 8, "", center)?,
    };

    Ok(())
}

#[async_trait]
impl ReportGenerator for TabularXlsxGenerator {
    fn kind(&self) -> ReportKind {
        ReportKind::TabularXlsx
    }

    async fn generate(&self, class_id: &str, object_key: &str) -> Result<(), GenerationError> {
        let mut workbook = Workbook::new();
        let formats = SheetFormats::new();

        let sheet = workbook.add_worksheet();
        sheet
            .set_name("Report")
            .map_err(|e| GenerationError::Render(e.to_string()))?;
        sheet.set_landscape();
        write_title_block(sheet, class_id).map_err(|e| GenerationError::Render(e.to_string()))?;

        let mut rows = self.participation.stream_for_class(class_id);
        let mut row_index = FIRST_DATA_ROW;
        while let Some(row) = rows.next().await {
            let row = row?;
            write_data_row(sheet, &formats, row_index, &row)
                .map_err(|e| GenerationError::Render(e.to_string()))?;
            row_index += 1;
        }
        drop(rows);

        let last_filter_row = if row_index > FIRST_DATA_ROW {
            row_index - 1
        } else {
            HEADER_ROW
        };
        sheet
            .autofilter(HEADER_ROW, 0, last_filter_row, LAST_COL)
            .map_err(|e| GenerationError::Render(e.to_string()))?;

        let bytes = workbook
            .save_to_buffer()
            .map_err(|e| GenerationError::Render(e.to_string()))?;

        log::info!(
            "Rendered XLSX report for class {} ({} rows, {} bytes)",
            class_id,
            row_index - FIRST_DATA_ROW,
            bytes.len()
        );

        upload_rendered(
            self.storage.clone(),
            object_key,
            ReportKind::TabularXlsx.content_type(),
            bytes,
        )
        .await?;
        Ok(())
    }
}
