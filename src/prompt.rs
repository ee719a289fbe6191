pub const INSTRUCTION_MARKER: &str = "### Instruction:";
pub const INPUT_MARKER: &str = "### Input:";
pub const RESPONSE_MARKER: &str = "### Response:";

const HEADER_WITH_INPUT: &str = "Below is an instruction that describes a task, paired with an input \
     that provides further context. Write a response that appropriately completes the request.";
const HEADER_INSTRUCTION_ONLY: &str =
    "Below is an instruction that describes a task. Write a response that appropriately completes the request.";

/// Frames `instruction` (and `context`, if any) for instruction-tuned models.
///
/// Without the template the instruction is passed through untouched and the
/// context is ignored.
pub fn build_prompt(instruction: &str, context: Option<&str>, use_template: bool) -> String {
    if !use_template {
        return instruction.to_string();
    }

    match context {
        Some(context) => format!(
            "{HEADER_WITH_INPUT}\n\n\
             {INSTRUCTION_MARKER}\n{instruction}\n\n\
             {INPUT_MARKER}\n{context}\n\n\
             {RESPONSE_MARKER}\n"
        ),
        None => format!(
            "{HEADER_INSTRUCTION_ONLY}\n\n\
             {INSTRUCTION_MARKER}\n{instruction}\n\n\
             {RESPONSE_MARKER}\n"
        ),
    }
}
