//! Prompt assembly for generation and review calls.

use crate::job::{FilePlanEntry, GeneratedFile, ImprovedSpec, ProjectType};
use crate::provider::ChatMessage;

const FILE_CONTRACT: &str = "Respond with a single JSON object of the form \
{\"path\": \"<file path>\", \"content\": \"<complete file content>\"} and nothing else.";

const FOUNDATION_CONTRACT: &str = "Respond with a single JSON array of objects of the form \
{\"path\": \"<file path>\", \"content\": \"<complete file content>\"}, one per requested file, \
and nothing else.";

const REVIEW_CONTRACT: &str = "Respond with a JSON array of objects of the form \
{\"file\": \"<path>\", \"issue\": \"<what is inconsistent>\", \"fix\": \"<suggested change>\"}. \
Respond with [] when the pages are consistent.";

pub fn system_message(project_type: ProjectType) -> ChatMessage {
    ChatMessage::system(format!(
        "You generate production-ready source files for a {} project. Output complete files, \
         never placeholders or ellipses.",
        project_type
    ))
}

fn render_spec(spec: &ImprovedSpec) -> String {
    let mut out = format!("Project: {}\nType: {}\n", spec.title, spec.project_type);
    if !spec.summary.is_empty() {
        out.push_str(&format!("Summary: {}\n", spec.summary));
    }
    if !spec.acceptance_checklist.is_empty() {
        out.push_str("Acceptance checklist:\n");
        for item in &spec.acceptance_checklist {
            out.push_str(&format!("- {}\n", item));
        }
    }
    out
}

fn render_entry(entry: &FilePlanEntry) -> String {
    let mut out = format!("- {}", entry.path);
    if !entry.purpose.is_empty() {
        out.push_str(&format!(": {}", entry.purpose));
    }
    if !entry.notes.is_empty() {
        out.push_str(&format!(" ({})", entry.notes));
    }
    out
}

/// Full content of every file generated so far.
fn render_context(context: &[GeneratedFile]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "Files already generated. Reuse their exact class names, IDs, functions and navigation:\n",
    );
    for file in context {
        out.push_str(&format!("\n=== {} ===\n{}\n", file.path, file.content));
    }
    out
}

pub fn file_messages(
    spec: &ImprovedSpec,
    entry: &FilePlanEntry,
    context: &[GeneratedFile],
    retry: bool,
) -> Vec<ChatMessage> {
    let mut user = render_spec(spec);
    user.push_str(&format!("\nGenerate this file:\n{}\n", render_entry(entry)));
    if retry {
        user.push_str("\nA previous attempt at this file failed. Follow the response format exactly.\n");
    }
    let context = render_context(context);
    if !context.is_empty() {
        user.push('\n');
        user.push_str(&context);
    }
    user.push('\n');
    user.push_str(FILE_CONTRACT);
    vec![system_message(spec.project_type), ChatMessage::user(user)]
}

pub fn foundation_messages(
    spec: &ImprovedSpec,
    entries: &[FilePlanEntry],
    context: &[GeneratedFile],
) -> Vec<ChatMessage> {
    let mut user = render_spec(spec);
    user.push_str(
        "\nGenerate these files together. The stylesheets and scripts must match the markup of \
         the page exactly:\n",
    );
    for entry in entries {
        user.push_str(&render_entry(entry));
        user.push('\n');
    }
    let context = render_context(context);
    if !context.is_empty() {
        user.push('\n');
        user.push_str(&context);
    }
    user.push('\n');
    user.push_str(FOUNDATION_CONTRACT);
    vec![system_message(spec.project_type), ChatMessage::user(user)]
}

pub fn consistency_messages(pages: &[&GeneratedFile]) -> Vec<ChatMessage> {
    let mut user = String::from(
        "Review these pages for drift in header, footer, navigation and styling between pages.\n",
    );
    for page in pages {
        user.push_str(&format!("\n=== {} ===\n{}\n", page.path, page.content));
    }
    user.push('\n');
    user.push_str(REVIEW_CONTRACT);
    vec![
        ChatMessage::system("You review generated websites for cross-page consistency."),
        ChatMessage::user(user),
    ]
}

pub fn prompt_chars(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|message| message.content.len()).sum()
}
