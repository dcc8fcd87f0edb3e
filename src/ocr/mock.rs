//! Deterministic mock OCR for tests and local development.
//!
//! Generates a realistic medical record laid out on synthetic page
//! geometry. Glyph drift (the classic S/5, O/0, l/1 misreads) can be
//! injected into the word stream while `full_text` stays clean, which
//! is exactly the divergence the entity matcher has to survive.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{OcrError, OcrProvider};
use crate::models::{BoundingBox, DocumentFormat, OcrPage, OcrResult, OcrWord};

const PAGE_WIDTH: f64 = 2550.0;
const PAGE_HEIGHT: f64 = 3300.0;
const MARGIN: f64 = 150.0;
const LINE_HEIGHT: f64 = 60.0;
const CHAR_WIDTH: f64 = 24.0;
const WORD_GAP: f64 = 24.0;
const LINES_PER_PAGE: usize = 15;

/// Every Nth word gets one glyph substituted when drift is enabled.
const GLYPH_ERROR_STRIDE: usize = 7;

/// Mock OCR provider with configurable failure injection.
pub struct MockOcrProvider {
    text: String,
    glyph_errors: bool,
    /// Number of leading calls that fail with a transport error.
    failures_remaining: AtomicU32,
}

impl MockOcrProvider {
    pub fn new() -> Self {
        Self::with_text(SAMPLE_MEDICAL_TEXT)
    }

    /// Use custom document text instead of the built-in record.
    pub fn with_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            glyph_errors: false,
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Inject deterministic OCR misreads into the word stream.
    pub fn with_glyph_errors(mut self) -> Self {
        self.glyph_errors = true;
        self
    }

    /// Fail the first `n` analyze calls with a transport error, then
    /// succeed. Exercises the runner's retry path.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    fn generate(&self) -> OcrResult {
        let lines: Vec<&str> = self.text.lines().collect();
        let mut pages = Vec::new();
        let mut word_counter = 0usize;

        for (page_index, page_lines) in lines.chunks(LINES_PER_PAGE).enumerate() {
            let page_number = page_index as u32 + 1;
            let mut words = Vec::new();
            for (line_index, line) in page_lines.iter().enumerate() {
                let y = MARGIN + line_index as f64 * LINE_HEIGHT;
                let mut x = MARGIN;
                for word in line.split_whitespace() {
                    let width = word.chars().count() as f64 * CHAR_WIDTH;
                    let text = if self.glyph_errors {
                        word_counter += 1;
                        if word_counter % GLYPH_ERROR_STRIDE == 0 {
                            misread(word)
                        } else {
                            word.to_string()
                        }
                    } else {
                        word.to_string()
                    };
                    words.push(OcrWord {
                        text,
                        confidence: 0.99,
                        bounding_box: BoundingBox::new(page_number, x, y, width, 40.0),
                    });
                    x += width + WORD_GAP;
                }
            }
            pages.push(OcrPage {
                page_number,
                width: PAGE_WIDTH,
                height: PAGE_HEIGHT,
                words,
            });
        }

        if pages.is_empty() {
            pages.push(OcrPage {
                page_number: 1,
                width: PAGE_WIDTH,
                height: PAGE_HEIGHT,
                words: Vec::new(),
            });
        }

        OcrResult {
            pages,
            full_text: self.text.clone(),
        }
    }
}

impl Default for MockOcrProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrProvider for MockOcrProvider {
    async fn analyze(
        &self,
        _bytes: &[u8],
        _format_hint: Option<DocumentFormat>,
        _language: Option<&str>,
    ) -> Result<OcrResult, OcrError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            debug!(remaining, "mock OCR simulating transport failure");
            return Err(OcrError::Transport("simulated OCR outage".to_string()));
        }
        Ok(self.generate())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Substitute the first glyph with a common misread.
fn misread(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut swapped = false;
    for c in word.chars() {
        let replacement = if swapped {
            c
        } else {
            match c {
                'S' => '5',
                '5' => 'S',
                'O' => '0',
                '0' => 'O',
                'l' => '1',
                '1' => 'l',
                other => other,
            }
        };
        if replacement != c {
            swapped = true;
        }
        out.push(replacement);
    }
    out
}

const SAMPLE_MEDICAL_TEXT: &str = "\
Patient: Samuel Grummons
DOB: 03/15/1985
MRN: 12345678

Chief Complaint: Follow-up for consultation

History of Present Illness:
Mr. Grummons is a 38-year-old male who presents today for follow-up
regarding his procedure performed on 06/22/2023. He reports
no complications and is doing well. His spouse, Jennifer Grummons,
is supportive of this decision.

Past Medical History:
- Hypertension, controlled on medication
- No prior surgeries

Medications:
- Lisinopril 10mg daily

Allergies: No known drug allergies

Social History:
Patient works as a software engineer at TechCorp Inc. He lives at
123 Main Street, Boston, MA 02101. Contact phone: (617) 555-1234.
Email: samuel.grummons@email.com

Insurance: Blue Cross Blue Shield Member ID: ABC123456789

Assessment and Plan:
Follow-up is satisfactory. Patient advised to continue routine
health maintenance. Next appointment scheduled for annual
physical on 12/15/2023.

Attending Physician: Dr. Sarah Johnson, MD
Date of Service: 09/30/2023";
