use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{info, warn};
use pdfium_render::prelude::*;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use crate::config::OpenAIConfig;
use crate::llm;

/// 埋め込みテキスト抽出をあきらめてOCRに切り替える文字数のしきい値
const MIN_EMBEDDED_TEXT_CHARS: usize = 50;

/// ファイル種別を判定して適切な方法でテキストを抽出する
pub async fn extract_from_file(path: &Path, config: &OpenAIConfig) -> Result<String> {
    if !path.exists() {
        anyhow::bail!("file not found: {}", path.display());
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if extension == "pdf" {
        extract_from_pdf(path, config).await
    } else if mime_for_extension(&extension).is_some() {
        extract_from_image(path, config).await
    } else {
        anyhow::bail!("unsupported file type: .{}", extension);
    }
}

/// PDFからテキストを抽出する
///
/// まず埋め込みテキストを直接読み、ほとんど取れない場合（スキャンPDF）は
/// ページを画像化してvision OCRにかける
pub async fn extract_from_pdf(path: &Path, config: &OpenAIConfig) -> Result<String> {
    info!("Extracting text from PDF: {}", path.display());

    let text = extract_embedded_text(path)?;

    if text.trim().len() >= MIN_EMBEDDED_TEXT_CHARS {
        info!("Extracted {} characters using direct method", text.len());
        return Ok(text);
    }

    warn!("Direct extraction yielded little text, falling back to vision OCR");

    let page_urls = render_pages_to_data_urls(path)?;
    info!("Rendered PDF to {} page image(s)", page_urls.len());

    let mut ocr_text = String::new();
    for (page_num, data_url) in page_urls.iter().enumerate() {
        info!("Processing page {} with vision OCR", page_num + 1);
        let page_text = llm::extract_text_from_image(config, data_url)
            .await
            .with_context(|| format!("OCR failed for page {}", page_num + 1))?;

        if !page_text.trim().is_empty() {
            ocr_text.push_str(&format!("\n--- Page {} ---\n", page_num + 1));
            ocr_text.push_str(&page_text);
        }
    }

    info!("Extracted {} characters using vision OCR", ocr_text.len());
    Ok(ocr_text.trim().to_string())
}

/// 画像ファイルからvision OCRでテキストを抽出する
pub async fn extract_from_image(path: &Path, config: &OpenAIConfig) -> Result<String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let mime = mime_for_extension(&extension)
        .ok_or_else(|| anyhow::anyhow!("unsupported image type: .{}", extension))?;

    info!("Extracting text from image: {}", path.display());

    let bytes = fs::read(path)
        .with_context(|| format!("failed to read image file {}", path.display()))?;

    let data_url = format!("data:{};base64,{}", mime, STANDARD.encode(&bytes));

    let text = llm::extract_text_from_image(config, &data_url).await?;
    info!("Extracted {} characters", text.len());

    Ok(text.trim().to_string())
}

fn bind_pdfium() -> Result<Pdfium> {
    let bindings = Pdfium::bind_to_system_library()
        .context("Failed to bind to the pdfium library")?;
    Ok(Pdfium::new(bindings))
}

/// PDFの埋め込みテキストをページごとに読み出す
fn extract_embedded_text(path: &Path) -> Result<String> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open PDF {}", path.display()))?;

    info!("PDF has {} page(s)", document.pages().len());

    let mut text = String::new();
    for (index, page) in document.pages().iter().enumerate() {
        let page_text = page.text().map(|t| t.all()).unwrap_or_default();
        if !page_text.trim().is_empty() {
            text.push_str(&format!("\n--- Page {} ---\n", index + 1));
            text.push_str(&page_text);
        }
    }

    Ok(text.trim().to_string())
}

/// 各ページをPNG画像のdata URLに変換する
fn render_pages_to_data_urls(path: &Path) -> Result<Vec<String>> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open PDF {}", path.display()))?;

    let render_config = PdfRenderConfig::new().set_target_width(1600);

    let mut urls = Vec::new();
    for page in document.pages().iter() {
        let image = page
            .render_with_config(&render_config)
            .context("failed to render PDF page")?
            .as_image();

        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageFormat::Png)
            .context("failed to encode page as PNG")?;

        urls.push(format!(
            "data:image/png;base64,{}",
            STANDARD.encode(buffer.get_ref())
        ));
    }

    Ok(urls)
}

/// 拡張子からMIMEタイプを引く
pub(crate) fn mime_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "bmp" => Some("image/bmp"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_image_extensions_have_mime_types() {
        assert_eq!(mime_for_extension("png"), Some("image/png"));
        assert_eq!(mime_for_extension("jpg"), Some("image/jpeg"));
        assert_eq!(mime_for_extension("jpeg"), Some("image/jpeg"));
        assert_eq!(mime_for_extension("webp"), Some("image/webp"));
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        assert_eq!(mime_for_extension("docx"), None);
        assert_eq!(mime_for_extension("pdf"), None);
        assert_eq!(mime_for_extension(""), None);
    }
}
