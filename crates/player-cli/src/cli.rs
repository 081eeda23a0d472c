use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "player-cli", version)]
pub struct Args {
    /// Audio files to play, one after another
    pub files: Vec<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML engine config; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Times to play each file; 0 loops forever
    #[arg(long, default_value_t = 1)]
    pub loop_count: u32,

    /// Sound volume (1.0 = unchanged)
    #[arg(long)]
    pub volume: Option<f32>,

    /// Play rate (2.0 = double speed, one octave up)
    #[arg(long, default_value_t = 1.0)]
    pub play_rate: f32,

    /// Start all files at once instead of in sequence
    #[arg(long)]
    pub together: bool,

    /// Maximum simultaneously playing sounds (0 = unlimited)
    #[arg(long)]
    pub concurrent_limit: Option<usize>,

    /// Look-ahead kept queued for streamed files, in seconds
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// Always stream files instead of decoding small ones up front
    #[arg(long)]
    pub stream: bool,

    /// Play a generated 440 Hz tone of this many seconds
    #[arg(long)]
    pub tone: Option<f64>,

    /// Use the silent backend (no audio device)
    #[arg(long)]
    pub null: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_files_and_overrides() {
        let args = Args::parse_from([
            "player-cli",
            "--loop-count",
            "3",
            "--volume",
            "0.5",
            "--together",
            "a.flac",
            "b.wav",
        ]);
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.loop_count, 3);
        assert_eq!(args.volume, Some(0.5));
        assert!(args.together);
        assert!(!args.null);
    }

    #[test]
    fn defaults_play_once_at_normal_rate() {
        let args = Args::parse_from(["player-cli", "x.mp3"]);
        assert_eq!(args.loop_count, 1);
        assert_eq!(args.play_rate, 1.0);
        assert!(args.device.is_none());
    }
}
