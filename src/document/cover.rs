//! Generated cover page for consolidated remisiones.

use chrono::{DateTime, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use rust_decimal::Decimal;

use super::converter::{A4_HEIGHT_PT, A4_WIDTH_PT};
use super::error::ConversionError;
use super::merge::{media_box, single_page_document};
use crate::state_machine::Remision;

const NOT_AVAILABLE: &str = "N/A";
const TITLE: &str = "REMISIÓN CONSOLIDADA";

struct TextRun {
    text: String,
    x: f32,
    y: f32,
    size: i64,
    color: [f32; 3],
}

/// The labelled lines printed on the cover, top to bottom.
pub fn cover_lines(remision: &Remision) -> Vec<String> {
    let or_na = |value: &str| {
        if value.trim().is_empty() {
            NOT_AVAILABLE.to_string()
        } else {
            value.to_string()
        }
    };
    let fecha = remision
        .fecha_remision
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());
    let total = if remision.total.is_zero() {
        NOT_AVAILABLE.to_string()
    } else {
        format_cop(remision.total)
    };

    vec![
        format!("Remisión: {}", or_na(remision.remision.as_str())),
        format!("Móvil: {}", or_na(remision.movil.as_str())),
        format!("No. Orden: {}", or_na(remision.no_orden.as_str())),
        format!("Estado: {}", remision.estado),
        format!("UNE: {}", or_na(remision.une.as_deref().unwrap_or_default())),
        format!("Fecha: {fecha}"),
        format!("Total: {total}"),
    ]
}

/// Build a one-page A4 document describing the remisión.
pub fn cover_document(
    remision: &Remision,
    generated_at: DateTime<Utc>,
) -> Result<Document, ConversionError> {
    let mut runs = vec![TextRun {
        text: TITLE.to_string(),
        x: A4_WIDTH_PT / 2.0 - 100.0,
        y: A4_HEIGHT_PT - 100.0,
        size: 24,
        color: [0.0, 0.2, 0.5],
    }];
    let mut y = A4_HEIGHT_PT - 200.0;
    for line in cover_lines(remision) {
        runs.push(TextRun {
            text: line,
            x: 50.0,
            y,
            size: 14,
            color: [0.0, 0.0, 0.0],
        });
        y -= 25.0;
    }
    runs.push(TextRun {
        text: format!("Generado el {}", generated_at.format("%d/%m/%Y %H:%M UTC")),
        x: 50.0,
        y: 50.0,
        size: 10,
        color: [0.5, 0.5, 0.5],
    });

    let mut operations = Vec::with_capacity(runs.len() * 6);
    for run in runs {
        let [r, g, b] = run.color;
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("rg", vec![r.into(), g.into(), b.into()]));
        operations.push(Operation::new("Tf", vec!["F1".into(), run.size.into()]));
        operations.push(Operation::new("Td", vec![run.x.into(), run.y.into()]));
        operations.push(Operation::new(
            "Tj",
            vec![Object::string_literal(win_ansi(&run.text))],
        ));
        operations.push(Operation::new("ET", vec![]));
    }
    let encoded = Content { operations }
        .encode()
        .map_err(|e| ConversionError::Pdf(e.to_string()))?;

    let mut doc = Document::with_version("1.5");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
    let page = dictionary! {
        "MediaBox" => media_box(A4_WIDTH_PT, A4_HEIGHT_PT),
        "Contents" => content_id,
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        },
    };
    Ok(single_page_document(doc, page))
}

/// Colombian peso formatting: `$ 1.234.567`, no decimals.
pub fn format_cop(amount: Decimal) -> String {
    let rounded = amount.round_dp(0).abs().to_string();
    let digits = rounded.split('.').next().unwrap_or_default();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    let sign = if amount < Decimal::ZERO { "-" } else { "" };
    format!("{sign}$ {grouped}")
}

// Standard-14 fonts with WinAnsiEncoding cover Latin-1, which is all Spanish needs.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
