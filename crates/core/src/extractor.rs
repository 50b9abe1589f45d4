use crate::chunking::clean_page_text;
use crate::error::IngestError;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Text of one physical page. `number` is 1-based and pages are dense.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("LLM_OCR_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("LLM_OCR_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|key| !key.is_empty());

        Some(Self { endpoint, api_key })
    }
}

/// Turns uploaded PDF bytes into ordered page texts. Blocking; callers run it off the runtime.
pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, name: &str, bytes: &[u8]) -> Result<Vec<PageText>, IngestError>;
}

pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(5).any(|window| window == b"%PDF-")
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, name: &str, bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::Extraction(error.to_string()))?;

        let mut pages = Vec::new();
        for (index, (page_no, _page_id)) in document.get_pages().into_iter().enumerate() {
            let text = match document.extract_text(&[page_no]) {
                Ok(text) => clean_page_text(&text),
                Err(error) => {
                    debug!(name, page = page_no, error = %error, "page text unreadable, keeping it empty");
                    String::new()
                }
            };

            pages.push(PageText {
                number: (index + 1) as u32,
                text,
            });
        }

        ensure_readable(name, pages)
    }
}

/// lopdf first, then the multimodal OCR endpoint when one is configured.
pub struct FallbackPdfExtractor {
    primary: LopdfExtractor,
    ocr: Option<OcrEndpointConfig>,
}

impl FallbackPdfExtractor {
    pub fn new(ocr: Option<OcrEndpointConfig>) -> Self {
        Self {
            primary: LopdfExtractor,
            ocr,
        }
    }

    pub fn from_env() -> Self {
        Self::new(OcrEndpointConfig::from_env())
    }
}

impl PdfExtractor for FallbackPdfExtractor {
    fn extract_pages(&self, name: &str, bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
        match self.primary.extract_pages(name, bytes) {
            Ok(pages) => Ok(pages),
            Err(IngestError::Extraction(parse_error)) => match &self.ocr {
                None => Err(IngestError::Extraction(parse_error)),
                Some(cfg) => {
                    warn!(name, error = %parse_error, "falling back to multimodal OCR");
                    extract_with_llm_ocr(cfg, name, bytes).map_err(|ocr_error| {
                        IngestError::Extraction(format!(
                            "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                        ))
                    })
                }
            },
            Err(error) => Err(error),
        }
    }
}

fn ensure_readable(name: &str, pages: Vec<PageText>) -> Result<Vec<PageText>, IngestError> {
    if pages.is_empty() {
        return Err(IngestError::Extraction(format!("pdf has no pages: {name}")));
    }
    if pages.iter().all(|page| page.text.trim().is_empty()) {
        return Err(IngestError::Extraction(format!(
            "pdf had no readable page text: {name}"
        )));
    }
    Ok(pages)
}

fn extract_with_llm_ocr(
    cfg: &OcrEndpointConfig,
    name: &str,
    bytes: &[u8],
) -> Result<Vec<PageText>, IngestError> {
    let payload = LlmOcrRequest {
        pdf_base64: STANDARD.encode(bytes),
        source_name: name.to_string(),
    };

    let mut request = Client::new()
        .post(&cfg.endpoint)
        .header("content-type", "application/json")
        .json(&payload);

    if let Some(api_key) = &cfg.api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request.send()?;

    if !response.status().is_success() {
        return Err(IngestError::Extraction(format!(
            "multimodal OCR request to {} returned {}",
            cfg.endpoint,
            response.status()
        )));
    }

    let payload: LlmOcrResponse = response.json()?;
    let pages = payload_to_pages(&payload, name)?;
    ensure_readable(name, pages)
}

/// Highest page number accepted from an OCR response. Pages are laid out densely up to
/// the largest number, so this bounds the allocation.
const MAX_OCR_PAGE_NUMBER: u32 = 10_000;

fn payload_to_pages(payload: &LlmOcrResponse, name: &str) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let numbered = listed
            .iter()
            .enumerate()
            .filter_map(|(index, page)| {
                let number = page.page.unwrap_or((index + 1) as u32).max(1);
                if number > MAX_OCR_PAGE_NUMBER {
                    warn!(name, page = number, "OCR page number out of range, dropping it");
                    return None;
                }
                let text = page.text.as_deref().map(clean_page_text).unwrap_or_default();
                Some((number, text))
            })
            .collect::<Vec<_>>();

        if let Some(last) = numbered.iter().map(|(number, _)| *number).max() {
            let mut dense = (1..=last)
                .map(|number| PageText {
                    number,
                    text: String::new(),
                })
                .collect::<Vec<_>>();
            for (number, text) in numbered {
                let slot = &mut dense[(number - 1) as usize];
                if slot.text.is_empty() {
                    slot.text = text;
                }
            }
            return Ok(dense);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .trim_end_matches('\u{000c}')
            .split('\u{000c}')
            .enumerate()
            .map(|(index, chunk)| PageText {
                number: (index + 1) as u32,
                text: clean_page_text(chunk),
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::Extraction(format!(
        "multimodal OCR response was empty for {name}"
    )))
}

#[cfg(test)]
mod tests {
    use super::{
        looks_like_pdf, payload_to_pages, LlmOcrPage, LlmOcrResponse, LopdfExtractor, PdfExtractor,
        MAX_OCR_PAGE_NUMBER,
    };
    use crate::IngestError;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    fn sample_pdf(page_texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut kids = Vec::new();
        for text in page_texts {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![100.into(), 600.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn lopdf_extracts_one_entry_per_page() {
        let bytes = sample_pdf(&["Alpha terms", "Bravo terms", "Charlie terms"]);
        assert!(looks_like_pdf(&bytes));

        let pages = LopdfExtractor.extract_pages("sample.pdf", &bytes).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(
            pages.iter().map(|page| page.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(pages[1].text.contains("Bravo"));
    }

    #[test]
    fn garbage_bytes_fail_extraction() {
        let result = LopdfExtractor.extract_pages("junk.pdf", b"%PDF-1.4\n%broken");
        assert!(matches!(result, Err(IngestError::Extraction(_))));
        assert!(!looks_like_pdf(b"PK\x03\x04 zip archive"));
    }

    #[test]
    fn ocr_payload_pages_are_made_dense() {
        let response = LlmOcrResponse {
            pages: Some(vec![
                LlmOcrPage {
                    page: Some(1),
                    text: Some("  ".to_string()),
                },
                LlmOcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, "x.pdf").expect("multimodal response should be parsed");

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].text, "");
        assert_eq!(pages[1].text, "");
        assert_eq!(pages[2].number, 3);
        assert_eq!(pages[2].text, "Page 3");
    }

    #[test]
    fn ocr_payload_ignores_absurd_page_numbers() {
        let response = LlmOcrResponse {
            pages: Some(vec![
                LlmOcrPage {
                    page: Some(2),
                    text: Some("Real page".to_string()),
                },
                LlmOcrPage {
                    page: Some(u32::MAX),
                    text: Some("Bogus".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, "x.pdf").expect("multimodal response should be parsed");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].text, "Real page");

        let only_bogus = LlmOcrResponse {
            pages: Some(vec![LlmOcrPage {
                page: Some(MAX_OCR_PAGE_NUMBER + 1),
                text: Some("Bogus".to_string()),
            }]),
            text: None,
        };
        assert!(matches!(
            payload_to_pages(&only_bogus, "x.pdf"),
            Err(IngestError::Extraction(_))
        ));
    }

    #[test]
    fn ocr_payload_fallback_text_split_by_form_feed() {
        let response = LlmOcrResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response, "x.pdf").expect("multimodal response should be parsed");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[0].text, "First");
        assert_eq!(pages[1].number, 2);
        assert_eq!(pages[1].text, "Second");
    }
}
