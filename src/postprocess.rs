use crate::prompt::RESPONSE_MARKER;

const PAD_MARKER: &str = "<pad>";
const EOS_MARKER: &str = "</s>";

/// Strips template and special-token residue from a decoded generation.
///
/// Steps run in a fixed order: keep the segment after the first response
/// marker, drop every copy of the prompt, drop pad markers when the text
/// starts with one, drop end-of-sequence markers, trim.
pub fn post_process(output: &str, prompt: &str) -> String {
    let mut output = match output.split(RESPONSE_MARKER).nth(1) {
        Some(response) => response.to_string(),
        None => output.to_string(),
    };

    if !prompt.is_empty() && output.contains(prompt) {
        output = output.replace(prompt, "");
    }

    if output.trim_start().starts_with(PAD_MARKER) {
        output = remove_all(output, PAD_MARKER);
    }

    remove_all(output, EOS_MARKER).trim().to_string()
}

/// Removes `marker` until none is left, including copies formed by earlier removals.
fn remove_all(mut text: String, marker: &str) -> String {
    while text.contains(marker) {
        text = text.replace(marker, "");
    }
    text
}
