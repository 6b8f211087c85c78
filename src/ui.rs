use crate::session::UploadSummary;
use crate::task::{FileStatus, FileTask};
use crate::types::ByteSize;

pub fn info(message: &str) {
    println!("{message}");
}

pub fn warn(message: &str) {
    eprintln!("warning: {message}");
}

pub fn error(message: &str) {
    eprintln!("error: {message}");
}

pub fn blank_line() {
    println!();
}

/// One line per status change, e.g. `[ready]      a.jpg`.
pub fn task_line(task: &FileTask) -> String {
    let label = format!("[{}]", task.status);
    match (task.status, task.error_message()) {
        (FileStatus::Uploading, _) => format!(
            "{:<13}{} {}%",
            label, task.file_name, task.upload_progress_percent
        ),
        (_, Some(message)) => format!("{:<13}{}: {}", label, task.file_name, message),
        _ => format!("{:<13}{}", label, task.file_name),
    }
}

pub fn upload_summary(summary: &UploadSummary, tasks: &[FileTask], gallery: &str) {
    blank_line();
    for task in tasks.iter().filter(|task| task.status == FileStatus::Error) {
        println!(
            "  {} failed: {}",
            task.file_name,
            task.error_message().unwrap_or("unknown error")
        );
    }
    println!(
        "Summary: {} in '{}' ({} transferred)",
        capitalize(&summary.to_string()),
        gallery,
        ByteSize::new(summary.transferred_bytes)
    );
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
