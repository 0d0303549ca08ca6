//! Text-to-speech through the Piper CLI, played with `aplay`.

use crate::config::SpeechConfig;
use greeter_core::greeting::{SpeechError, SpeechSynthesizer};
use std::io::Write;
use std::process::{Child, Command, Stdio};

/// Pipes `piper --output-raw` (16-bit mono PCM) straight into the player.
pub struct PiperSpeaker {
    piper_binary: String,
    voice_model: String,
    player_binary: String,
    sample_rate: u32,
}

impl PiperSpeaker {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            piper_binary: config.piper_binary.clone(),
            voice_model: config.voice_model.to_string_lossy().into_owned(),
            player_binary: config.player_binary.clone(),
            sample_rate: config.sample_rate,
        }
    }

    fn piper_args(&self) -> Vec<String> {
        vec![
            "--model".into(),
            self.voice_model.clone(),
            "--output-raw".into(),
        ]
    }

    fn player_args(&self) -> Vec<String> {
        vec![
            "-r".into(),
            self.sample_rate.to_string(),
            "-f".into(),
            "S16_LE".into(),
            "-t".into(),
            "raw".into(),
            "-c".into(),
            "1".into(),
            "-q".into(),
        ]
    }
}

impl SpeechSynthesizer for PiperSpeaker {
    fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let mut piper = Command::new(&self.piper_binary)
            .args(self.piper_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SpeechError::Spawn {
                program: self.piper_binary.clone(),
                source,
            })?;

        let pcm = piper.stdout.take().map(Stdio::from).unwrap_or_else(Stdio::null);
        let player = Command::new(&self.player_binary)
            .args(self.player_args())
            .stdin(pcm)
            .spawn();
        let mut player = match player {
            Ok(p) => p,
            Err(source) => {
                let _ = piper.kill();
                let _ = piper.wait();
                return Err(SpeechError::Spawn {
                    program: self.player_binary.clone(),
                    source,
                });
            }
        };

        // stdin is dropped at the end of the match so piper sees EOF
        let written = match piper.stdin.take() {
            Some(mut stdin) => stdin
                .write_all(text.as_bytes())
                .and_then(|_| stdin.write_all(b"\n")),
            None => Ok(()),
        };

        // Both children are always waited on, whatever failed first.
        let piper_done = wait_ok(&mut piper, &self.piper_binary);
        if written.is_err() || piper_done.is_err() {
            let _ = player.kill();
        }
        let player_done = wait_ok(&mut player, &self.player_binary);

        written?;
        piper_done?;
        player_done?;
        tracing::debug!(chars = text.len(), "speech played");
        Ok(())
    }
}

fn wait_ok(child: &mut Child, program: &str) -> Result<(), SpeechError> {
    let status = child.wait()?;
    if status.success() {
        Ok(())
    } else {
        Err(SpeechError::Exited {
            program: program.to_string(),
            status: status.to_string(),
        })
    }
}

/// Used when speech is disabled: the greeting is only logged.
pub struct SilentSpeaker;

impl SpeechSynthesizer for SilentSpeaker {
    fn speak(&self, text: &str) -> Result<(), SpeechError> {
        tracing::info!(text, "speech disabled; not playing greeting");
        Ok(())
    }
}

/// Either speaker, chosen at startup.
pub enum Speaker {
    Piper(PiperSpeaker),
    Silent(SilentSpeaker),
}

impl Speaker {
    pub fn from_config(config: &SpeechConfig) -> Self {
        if config.enabled {
            Speaker::Piper(PiperSpeaker::new(config))
        } else {
            Speaker::Silent(SilentSpeaker)
        }
    }
}

impl SpeechSynthesizer for Speaker {
    fn speak(&self, text: &str) -> Result<(), SpeechError> {
        match self {
            Speaker::Piper(p) => p.speak(text),
            Speaker::Silent(s) => s.speak(text),
        }
    }
}
