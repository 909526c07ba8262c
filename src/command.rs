/// Trigger-phrase extraction and prompt composition for `/code` comments.

/// Extract the user instruction following the trigger keyword.
///
/// Returns `None` when the comment does not contain the trigger at all.
/// An empty instruction after the trigger is still a hit (the issue body
/// provides the context in that case).
pub fn extract_prompt(body: &str, trigger_keyword: &str) -> Option<String> {
    let idx = body.find(trigger_keyword)?;
    let remaining = body[idx + trigger_keyword.len()..].trim();
    Some(remaining.to_string())
}

/// Compose the final prompt: the trigger instruction is the primary
/// directive, the issue/PR content is contextual reference.
pub fn build_prompt(title: &str, body: &str, user_instruction: &str) -> String {
    let instruction = user_instruction.trim();
    let title = title.trim();
    let body = body.trim();

    let mut out = String::new();

    if !instruction.is_empty() {
        out.push_str(instruction);
    }

    if !title.is_empty() || !body.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n---\n\n");
        }
        out.push_str("# Issue Context");
        if !title.is_empty() {
            out.push_str("\n\n## Title\n");
            out.push_str(title);
        }
        if !body.is_empty() {
            out.push_str("\n\n## Body\n");
            out.push_str(body);
        }
    }

    out
}

/// Short human-readable form used in tracking comments.
pub fn build_prompt_summary(title: &str, user_instruction: &str, is_pr: bool) -> String {
    let title = title.trim();
    let instruction = summarize_instruction(user_instruction, 180);

    let mut out = String::new();
    if !title.is_empty() {
        out.push_str(if is_pr { "**PR:** " } else { "**Issue:** " });
        out.push_str(title);
    }

    if !instruction.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("**Instruction:**\n");
        out.push_str(&instruction);
    }

    out
}

/// Squeeze a multi-line instruction into one line, truncated with `…`.
pub fn summarize_instruction(instruction: &str, limit: usize) -> String {
    let parts: Vec<&str> = instruction
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if parts.is_empty() {
        return String::new();
    }

    truncate_text(&parts.join(" "), limit)
}

/// Truncate on a char boundary, appending `…` when anything was cut.
pub fn truncate_text(text: &str, limit: usize) -> String {
    let text = text.trim();
    if limit == 0 || text.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return text.to_string();
    }

    let truncated: String = chars[..limit].iter().collect();
    format!("{}…", truncated.trim_end())
}
