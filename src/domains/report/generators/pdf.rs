use std::io::BufWriter;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use printpdf::{
    BuiltinFont, IndirectFontRef, Line, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference,
    Point,
};

use crate::domains::core::blob_storage_service::BlobStorageService;
use crate::domains::participation::{ParticipationRepository, ParticipationRow};
use crate::domains::report::types::ReportKind;

use super::{fit_column, upload_rendered, GenerationError, ReportGenerator};

// A4 portrait layout, all in millimeters.
const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 15.0;
const ROW_HEIGHT: f32 = 6.0;
const BOTTOM_LIMIT: f32 = 20.0;

const COL_STUDENT: f32 = MARGIN;
const COL_ACTIVITY: f32 = 78.0;
const COL_SCORE: f32 = 136.0;
const COL_GRADE: f32 = 156.0;
const COL_STATUS: f32 = 174.0;

/// Streams class rows into a paginated tabular PDF.
pub struct TabularPdfGenerator {
    participation: Arc<dyn ParticipationRepository>,
    storage: Arc<dyn BlobStorageService>,
}

impl TabularPdfGenerator {
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

struct PageFonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

fn draw_table_header(layer: &PdfLayerReference, fonts: &PageFonts, y: f32) {
    layer.use_text("Student", 11.0, Mm(COL_STUDENT), Mm(y), &fonts.bold);
    layer.use_text("Activity", 11.0, Mm(COL_ACTIVITY), Mm(y), &fonts.bold);
    layer.use_text("Score", 11.0, Mm(COL_SCORE), Mm(y), &fonts.bold);
    layer.use_text("Grade", 11.0, Mm(COL_GRADE), Mm(y), &fonts.bold);
    layer.use_text("Status", 11.0, Mm(COL_STATUS), Mm(y), &fonts.bold);

    let rule = Line {
        points: vec![
            (Point::new(Mm(MARGIN), Mm(y - 1.5)), false),
            (Point::new(Mm(PAGE_WIDTH - MARGIN), Mm(y - 1.5)), false),
        ],
        is_closed: false,
    };
    layer.add_line(rule);
}

fn draw_row(layer: &PdfLayerReference, fonts: &PageFonts, y: f32, row: &ParticipationRow) {
    let score = row
        .score
        .map(|s| format!("{:.2}", s))
        .unwrap_or_else(|| "-".to_string());
    let grade = row.grade.as_deref().unwrap_or("-");
    let status = row.evaluation_status.as_deref().unwrap_or("-");

    layer.use_text(
        fit_column(&row.student_name, 34),
        10.0,
        Mm(COL_STUDENT),
        Mm(y),
        &fonts.regular,
    );
    layer.use_text(
        fit_column(&row.activity_name, 30),
        10.0,
        Mm(COL_ACTIVITY),
        Mm(y),
        &fonts.regular,
    );
    layer.use_text(score, 10.0, Mm(COL_SCORE), Mm(y), &fonts.regular);
    layer.use_text(grade, 10.0, Mm(COL_GRADE), Mm(y), &fonts.regular);
    layer.use_text(
        fit_column(status, 18),
        10.0,
        Mm(COL_STATUS),
        Mm(y),
        &fonts.regular,
    );
}

fn new_table_page(doc: &PdfDocumentReference, fonts: &PageFonts) -> (PdfLayerReference, f32) {
    let (page, layer_index) = doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Table");
    let layer = doc.get_page(page).get_layer(layer_index);
    let header_y = PAGE_HEIGHT - MARGIN;
    draw_table_header(&layer, fonts, header_y);
    (layer, header_y - ROW_HEIGHT - 1.0)
}

#[async_trait]
impl ReportGenerator for TabularPdfGenerator {
    fn kind(&self) -> ReportKind {
        ReportKind::TabularPdf
    }

    async fn generate(&self, class_id: &str, object_key: &str) -> Result<(), GenerationError> {
        let (doc, first_page, first_layer) = PdfDocument::new(
            "Class participation report",
            Mm(PAGE_WIDTH),
            Mm(PAGE_HEIGHT),
            "Table",
        );
        let fonts = PageFonts {
            regular: doc
                .add_builtin_font(BuiltinFont::Helvetica)
                .map_err(|e| GenerationError::Render(e.to_string()))?,
            bold: doc
                .add_builtin_font(BuiltinFont::HelveticaBold)
                .map_err(|e| GenerationError::Render(e.to_string()))?,
        };

        // First page carries the title block above the table.
        let mut layer = doc.get_page(first_page).get_layer(first_layer);
        let mut y = PAGE_HEIGHT - MARGIN - 5.0;
        layer.use_text(
            "Class participation report",
            18.0,
            Mm(MARGIN),
            Mm(y),
            &fonts.bold,
        );
        y -= 8.0;
        layer.use_text(
            format!("Class: {}", class_id),
            12.0,
            Mm(MARGIN),
            Mm(y),
            &fonts.regular,
        );
        y -= 12.0;
        draw_table_header(&layer, &fonts, y);
        y -= ROW_HEIGHT + 1.0;

        let mut rows = self.participation.stream_for_class(class_id);
        let mut row_count: u64 = 0;
        while let Some(row) = rows.next().await {
            let row = row?;
            if y < BOTTOM_LIMIT {
                let (next_layer, next_y) = new_table_page(&doc, &fonts);
                layer = next_layer;
                y = next_y;
            }
            draw_row(&layer, &fonts, y, &row);
            y -= ROW_HEIGHT;
            row_count += 1;
        }
        drop(rows);

        // Footer under the last written row.
        let footer_y = if y - 6.0 > 8.0 { y - 6.0 } else { 8.0 };
        layer.use_text(
            format!(
                "Generated at {} ({} rows)",
                chrono::Utc::now().format("%Y-%m-%d %H:%M UTC"),
                row_count
            ),
            9.0,
            Mm(MARGIN),
            Mm(footer_y),
            &fonts.regular,
        );

        let mut bytes: Vec<u8> = Vec::new();
        doc.save(&mut BufWriter::new(&mut bytes))
            .map_err(|e| GenerationError::Render(e.to_string()))?;

        log::info!(
            "Rendered PDF report for class {} ({} rows, {} bytes)",
            class_id,
            row_count,
            bytes.len()
        );

        upload_rendered(
            self.storage.clone(),
            object_key,
            ReportKind::TabularPdf.content_type(),
            bytes,
        )
        .await?;
        Ok(())
    }
}
