use std::fmt::{self, Write};

use serde::Deserialize;

use crate::model::{
    GenerationRequest, MAX_NEW_TOKENS_LIMIT, MAX_NUM_BEAMS, MAX_TOP_K, ModelMetadata,
};

pub const TITLE: &str = "LLM Generation";

/// Label/value pairs shown above the form.
pub fn description(meta: &ModelMetadata) -> Vec<(&'static str, String)> {
    let mut lines = vec![("Model", meta.name.clone())];
    if let Some(adapter) = &meta.adapter {
        lines.push(("Adapter", adapter.clone()));
    }
    lines.push((
        "Instruct Model?",
        if meta.instruct { "Yes" } else { "No" }.to_string(),
    ));
    lines.push((
        "Inference Mode",
        if meta.quantized { "8-bit Int" } else { "16-bit Float" }.to_string(),
    ));
    lines
}

/// Urlencoded body of the form.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateForm {
    pub instruction: String,
    #[serde(default)]
    pub context: String,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub num_beams: usize,
    pub max_new_tokens: usize,
}

impl Default for GenerateForm {
    fn default() -> Self {
        let request = GenerationRequest::new("");
        Self {
            instruction: String::new(),
            context: String::new(),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            num_beams: request.num_beams,
            max_new_tokens: request.max_new_tokens,
        }
    }
}

impl From<GenerateForm> for GenerationRequest {
    fn from(form: GenerateForm) -> Self {
        let mut request = GenerationRequest::new(form.instruction);
        request.context = Some(form.context).filter(|c| !c.trim().is_empty());
        request.temperature = form.temperature;
        request.top_p = form.top_p;
        request.top_k = form.top_k;
        request.num_beams = form.num_beams;
        request.max_new_tokens = form.max_new_tokens;
        request
    }
}

pub fn render_page(
    meta: &ModelMetadata,
    form: &GenerateForm,
    output: Option<&str>,
    error: Option<&str>,
) -> String {
    let mut html = String::with_capacity(4096);
    // fmt::Write for String is infallible.
    let _ = write_page(&mut html, meta, form, output, error);
    html
}

fn write_page(
    html: &mut String,
    meta: &ModelMetadata,
    form: &GenerateForm,
    output: Option<&str>,
    error: Option<&str>,
) -> fmt::Result {
    write!(
        html,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{TITLE}</title>\n\
         <style>body{{font-family:sans-serif;max-width:52rem;margin:2rem auto}}\
         label{{display:block;margin-top:.8rem}}textarea{{width:100%}}\
         .error{{color:#b00020}}</style>\n</head>\n<body>\n<h1>{TITLE}</h1>\n<div class=\"description\">\n"
    )?;
    for (label, value) in description(meta) {
        writeln!(html, "<p><strong>{label}:</strong> {}</p>", escape_html(&value))?;
    }
    html.push_str("</div>\n<form method=\"post\" action=\"/\">\n");

    writeln!(
        html,
        "<label>Input<textarea name=\"instruction\" rows=\"2\" \
         placeholder=\"Prompt for all models go here.\">{}</textarea></label>",
        escape_html(&form.instruction)
    )?;
    writeln!(
        html,
        "<label>Context<textarea name=\"context\" rows=\"2\" \
         placeholder=\"Input for Instruction Models go here.\">{}</textarea></label>",
        escape_html(&form.context)
    )?;
    slider(html, "Temperature", "temperature", 0.01, 1.0, 0.01, form.temperature)?;
    slider(html, "Top p", "top_p", 0.0, 1.0, 0.01, form.top_p)?;
    slider(html, "Top k", "top_k", 0.0, MAX_TOP_K as f64, 1.0, form.top_k as f64)?;
    slider(html, "Beams", "num_beams", 1.0, MAX_NUM_BEAMS as f64, 1.0, form.num_beams as f64)?;
    slider(
        html,
        "Max tokens",
        "max_new_tokens",
        1.0,
        MAX_NEW_TOKENS_LIMIT as f64,
        1.0,
        form.max_new_tokens as f64,
    )?;
    html.push_str("<p><button type=\"submit\">Submit</button></p>\n</form>\n");

    if let Some(error) = error {
        writeln!(html, "<p class=\"error\">{}</p>", escape_html(error))?;
    }
    writeln!(
        html,
        "<label>Output<textarea name=\"output\" rows=\"5\" readonly>{}</textarea></label>",
        escape_html(output.unwrap_or_default())
    )?;
    html.push_str("</body>\n</html>\n");
    Ok(())
}

fn slider(
    html: &mut String,
    label: &str,
    name: &str,
    min: f64,
    max: f64,
    step: f64,
    value: f64,
) -> fmt::Result {
    writeln!(
        html,
        "<label>{label} <output id=\"{name}_value\">{value}</output>\
         <input type=\"range\" name=\"{name}\" min=\"{min}\" max=\"{max}\" step=\"{step}\" value=\"{value}\" \
         oninput=\"document.getElementById('{name}_value').value=this.value\"></label>"
    )
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ModelKind,
        device::{ComputeDevice, DeviceProfile, Precision},
    };

    fn meta(adapter: Option<&str>, instruct: bool, quantized: bool) -> ModelMetadata {
        ModelMetadata {
            name: "llama-7b-hf".into(),
            adapter: adapter.map(str::to_string),
            kind: ModelKind::Causal,
            instruct,
            quantized,
            device: DeviceProfile {
                device: ComputeDevice::Cuda,
                precision: if quantized { Precision::Int8 } else { Precision::Float16 },
            },
        }
    }

    #[test]
    fn test_description_lines() {
        let lines = description(&meta(Some("alpaca-lora-7b"), true, true));
        assert_eq!(
            lines,
            vec![
                ("Model", "llama-7b-hf".to_string()),
                ("Adapter", "alpaca-lora-7b".to_string()),
                ("Instruct Model?", "Yes".to_string()),
                ("Inference Mode", "8-bit Int".to_string()),
            ]
        );

        let lines = description(&meta(None, false, false));
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], ("Instruct Model?", "No".to_string()));
        assert_eq!(lines[2], ("Inference Mode", "16-bit Float".to_string()));
    }

    #[test]
    fn test_form_to_request() {
        let form = GenerateForm {
            instruction: "Name a color".into(),
            context: "   ".into(),
            ..GenerateForm::default()
        };
        let request = GenerationRequest::from(form);
        assert_eq!(request.instruction, "Name a color");
        assert_eq!(request.context, None);
        assert_eq!(request.num_beams, 5);
        assert_eq!(request.max_new_tokens, 128);
    }

    #[test]
    fn test_page_is_complete() {
        let page = render_page(&meta(None, false, false), &GenerateForm::default(), None, None);
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.ends_with("</html>\n"));
        assert_eq!(page.matches("type=\"range\"").count(), 5);
        assert!(page.contains("name=\"max_new_tokens\" min=\"1\" max=\"2000\""));
        assert!(!page.contains("class=\"error\""));
    }

    #[test]
    fn test_page_escapes_user_text() {
        let form = GenerateForm {
            instruction: "<script>alert(1)</script>".into(),
            ..GenerateForm::default()
        };
        let page = render_page(&meta(None, false, false), &form, Some("a & b"), None);
        assert!(page.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(page.contains("a &amp; b"));
        assert!(page.contains(TITLE));
        assert!(page.contains("name=\"max_new_tokens\""));
    }
}
