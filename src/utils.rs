use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

/// Style of the progress bar attached to a whole build.
pub(crate) fn get_style_build() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Style of a single running task, no progress of its own.
pub(crate) fn get_style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::with_template("  {spinner:.blue} {msg} [{elapsed}]")
}
