//! Encoder command templates
//!
//! The operator configures the transcoder as a single shell-like string, e.g.
//! `ffmpeg -c:v libx264 -f hls -hls_time 4`. At spawn time the source path and
//! the manifest name are placed into it, either at `{input}` / `{output}`
//! placeholders or, when the template has none, at fixed positions:
//! `-i <source>` right after the program and the manifest name last.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;

use tokio::process::Command;

/// Template used when `ENCODER_COMMAND` is not set.
pub const DEFAULT_ENCODER_COMMAND: &str = "ffmpeg -v warning -c:v libx264 -preset veryfast -crf 23 \
     -c:a aac -b:a 128k -ac 2 -f hls -hls_time 4 -hls_playlist_type event";

/// Token replaced by the source media path.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Token replaced by the manifest file name.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("encoder command is empty")]
    Empty,
    #[error("encoder command has unbalanced quoting: {0}")]
    Unbalanced(String),
}

/// Parsed encoder command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeCommand {
    program: String,
    args: Vec<String>,
}

impl TranscodeCommand {
    pub fn parse(template: &str) -> Result<Self, CommandError> {
        let tokens =
            shlex::split(template).ok_or_else(|| CommandError::Unbalanced(template.to_string()))?;
        let (program, args) = tokens.split_first().ok_or(CommandError::Empty)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn has_placeholders(&self) -> bool {
        self.args
            .iter()
            .any(|a| a == INPUT_PLACEHOLDER || a == OUTPUT_PLACEHOLDER)
    }

    /// Arguments (program excluded) for transcoding `source` into `artifact`.
    pub fn arguments(&self, source: &Path, artifact: &str) -> Vec<OsString> {
        if self.has_placeholders() {
            return self
                .args
                .iter()
                .map(|arg| match arg.as_str() {
                    INPUT_PLACEHOLDER => source.as_os_str().to_os_string(),
                    OUTPUT_PLACEHOLDER => OsString::from(artifact),
                    _ => OsString::from(arg),
                })
                .collect();
        }

        let mut args = Vec::with_capacity(self.args.len() + 3);
        args.push(OsString::from("-i"));
        args.push(source.as_os_str().to_os_string());
        args.extend(self.args.iter().map(OsString::from));
        args.push(OsString::from(artifact));
        args
    }

    /// Build the subprocess. Output streams are passed through to ours.
    pub fn command(&self, source: &Path, artifact: &str, working_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.arguments(source, artifact))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl FromStr for TranscodeCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_fixed_positions() {
        let cmd = TranscodeCommand::parse("ffmpeg -c:v libx264 -f hls").unwrap();
        assert_eq!(cmd.program(), "ffmpeg");
        assert_eq!(
            strings(cmd.arguments(Path::new("/media/a b.mkv"), "abc1234.m3u8")),
            vec!["-i", "/media/a b.mkv", "-c:v", "libx264", "-f", "hls", "abc1234.m3u8"]
        );
    }

    #[test]
    fn test_placeholders() {
        let cmd = TranscodeCommand::parse("sh -c 'cp \"$0\" \"$1\"' {input} {output}").unwrap();
        assert_eq!(cmd.program(), "sh");
        assert_eq!(
            strings(cmd.arguments(Path::new("/media/x.mkv"), "abc1234.m3u8")),
            vec!["-c", "cp \"$0\" \"$1\"", "/media/x.mkv", "abc1234.m3u8"]
        );
    }

    #[test]
    fn test_program_only() {
        let cmd = TranscodeCommand::parse("encode").unwrap();
        assert_eq!(
            strings(cmd.arguments(Path::new("in.mkv"), "out.m3u8")),
            vec!["-i", "in.mkv", "out.m3u8"]
        );
    }

    #[test]
    fn test_invalid_templates() {
        assert_eq!(TranscodeCommand::parse("   "), Err(CommandError::Empty));
        assert!(matches!(
            TranscodeCommand::parse("ffmpeg -vf 'scale=1280:-2"),
            Err(CommandError::Unbalanced(_))
        ));
    }

    #[test]
    fn test_default_template_parses() {
        let cmd: TranscodeCommand = DEFAULT_ENCODER_COMMAND.parse().unwrap();
        assert_eq!(cmd.program(), "ffmpeg");
    }
}
