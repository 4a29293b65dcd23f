use crate::core::message::{Message, Role};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `-v` counts; output
/// goes to stderr so stdout stays free for command results and the stdio
/// demo server's protocol stream.
pub fn init_tracing(verbosity: u8) {
    let fallback = match verbosity {
        0 => "toolrelay=warn",
        1 => "toolrelay=info",
        2 => "toolrelay=debug",
        _ => "toolrelay=trace,reqwest=debug",
    };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Plain-text transcript of a chat session.
pub struct TranscriptLog {
    path: PathBuf,
    user_label: String,
}

impl TranscriptLog {
    /// Opens (creating if needed) the transcript file to verify it is writable.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            user_label: "You".to_string(),
        })
    }

    pub fn with_user_label(mut self, label: impl Into<String>) -> Self {
        self.user_label = label.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &Message) -> std::io::Result<()> {
        let Some(block) = self.render(message) else {
            return Ok(());
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        write_block(&mut writer, &block)?;
        writer.flush()
    }

    /// Replaces the file with `history`. The original is only swapped out
    /// once the new contents are fully on disk.
    pub fn rewrite(&self, history: &[Message]) -> std::io::Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp_file = NamedTempFile::new_in(parent)?;
        for block in history.iter().filter_map(|message| self.render(message)) {
            write_block(&mut temp_file, &block)?;
        }
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(&self.path)
            .map_err(|err| err.error)?;
        Ok(())
    }

    fn render(&self, message: &Message) -> Option<String> {
        match message.role {
            Role::User => Some(format!("{}: {}", self.user_label, message.content)),
            Role::Assistant if !message.content.trim().is_empty() => Some(message.content.clone()),
            Role::Assistant => None,
            Role::Tool => Some(format!(
                "## tool {}: {}",
                message.tool_call_id.as_deref().unwrap_or("?"),
                message.content
            )),
            Role::System => None,
        }
    }
}

fn write_block(writer: &mut impl Write, block: &str) -> std::io::Result<()> {
    for line in block.lines() {
        writeln!(writer, "{line}")?;
    }
    writeln!(writer)
}
