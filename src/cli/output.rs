//! Colored terminal output for assembly runs.

use std::io::Write;
use termcolor::{Buffer, BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

/// Console reporter for assembly progress and results.
///
/// Progress goes to stdout and is suppressed in quiet mode; errors always
/// go to stderr.
#[derive(Debug)]
pub struct Console {
    stdout: BufferWriter,
    stderr: BufferWriter,
    quiet: bool,
}

impl Console {
    /// Creates a console reporter.
    pub fn new(quiet: bool) -> Self {
        Self {
            stdout: BufferWriter::stdout(ColorChoice::Auto),
            stderr: BufferWriter::stderr(ColorChoice::Auto),
            quiet,
        }
    }

    /// Whether progress output is suppressed.
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Prints a progress message.
    pub fn info(&self, message: &str) -> std::io::Result<()> {
        self.marked(Color::Cyan, false, "*", message)
    }

    /// Prints a success message.
    pub fn success(&self, message: &str) -> std::io::Result<()> {
        self.marked(Color::Green, true, "✓", message)
    }

    /// Prints a warning.
    pub fn warn(&self, message: &str) -> std::io::Result<()> {
        self.marked(Color::Yellow, true, "⚠", message)
    }

    /// Prints an error to stderr. Never suppressed.
    pub fn error(&self, message: &str) {
        let mut buffer = self.stderr.buffer();
        if write_marked(&mut buffer, Color::Red, true, "✗", message).is_err()
            || self.stderr.print(&buffer).is_err()
        {
            // Last resort when stderr itself is gone.
            println!("✗ {message}");
        }
    }

    /// Prints a section header.
    pub fn section(&self, title: &str) -> std::io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut buffer = self.stdout.buffer();
        writeln!(&mut buffer)?;
        buffer.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)).set_bold(true))?;
        writeln!(&mut buffer, "═══ {title} ═══")?;
        buffer.reset()?;
        self.stdout.print(&buffer)
    }

    /// Prints indented detail under the previous line.
    pub fn indent(&self, message: &str) -> std::io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut buffer = self.stdout.buffer();
        writeln!(&mut buffer, "    {message}")?;
        self.stdout.print(&buffer)
    }

    /// Prints a plain line.
    pub fn println(&self, message: &str) -> std::io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut buffer = self.stdout.buffer();
        writeln!(&mut buffer, "{message}")?;
        self.stdout.print(&buffer)
    }

    fn marked(&self, color: Color, bold: bool, mark: &str, message: &str) -> std::io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut buffer = self.stdout.buffer();
        write_marked(&mut buffer, color, bold, mark, message)?;
        self.stdout.print(&buffer)
    }
}

fn write_marked(
    buffer: &mut Buffer,
    color: Color,
    bold: bool,
    mark: &str,
    message: &str,
) -> std::io::Result<()> {
    buffer.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(bold))?;
    write!(buffer, "{mark}")?;
    buffer.reset()?;
    writeln!(buffer, " {message}")
}
