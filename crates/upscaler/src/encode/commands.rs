//! External tool command lines.
//!
//! Builders only; nothing here spawns a process. Every builder sets
//! `kill_on_drop` so an abandoned child never outlives its task.

use crate::chunk::Chunk;
use crate::config::{EncoderConfig, ToolsConfig};
use crate::progress::ProgressMonitor;
use std::path::Path;
use tokio::process::Command;

/// Frame generator: renders `chunk`'s frames of `input` as y4m on stdout.
///
/// `cache` is the decoder's index file; the first chunk creates it and later
/// chunks reuse it.
pub fn frame_generator_command(
    tools: &ToolsConfig,
    input: &Path,
    cache: &Path,
    chunk: &Chunk,
) -> Command {
    let mut cmd = Command::new(&tools.vspipe);
    cmd.arg("-c").arg("y4m");
    cmd.arg(&tools.script);
    cmd.arg("-a").arg(script_arg("in", input));
    cmd.arg("-a").arg(script_arg("lwi", cache));
    cmd.arg("-a").arg(format!("from={}", chunk.start));
    cmd.arg("-a").arg(format!("to={}", chunk.end));
    cmd.arg("-");
    cmd.kill_on_drop(true);
    cmd
}

/// Encoder: reads y4m on stdin and writes a matroska file to `output`.
///
/// Progress reports go to stdout, see [`ProgressMonitor::encoder_args`].
pub fn encoder_command(tools: &ToolsConfig, encoder: &EncoderConfig, output: &Path) -> Command {
    let mut cmd = Command::new(&tools.ffmpeg);
    cmd.args(&encoder.input_args);
    cmd.arg("-i").arg("-");
    cmd.args(&encoder.encode_args);
    cmd.args(ProgressMonitor::encoder_args(encoder.stats_period_secs));
    cmd.arg("-y").arg(output);
    cmd.kill_on_drop(true);
    cmd
}

/// Probe: prints the number of video packets of `input` on stdout.
pub fn frame_count_command(tools: &ToolsConfig, input: &Path) -> Command {
    let mut cmd = Command::new(&tools.ffprobe);
    cmd.args(["-v", "error"]);
    cmd.args(["-select_streams", "v"]);
    cmd.arg("-count_packets");
    cmd.args(["-show_entries", "stream=nb_read_packets"]);
    cmd.args(["-of", "csv=p=0"]);
    cmd.arg(input);
    cmd.kill_on_drop(true);
    cmd
}

/// Concatenate the chunks listed in `manifest` and remux with the original.
///
/// Video comes from the chunks; every other stream (audio, subtitles,
/// attachments) plus global metadata is copied from `original`. No
/// re-encoding happens.
pub fn concat_command(
    tools: &ToolsConfig,
    manifest: &Path,
    original: &Path,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(&tools.ffmpeg);
    cmd.args(["-hide_banner", "-loglevel", "info"]);
    cmd.args(["-f", "concat", "-safe", "0"]);
    cmd.arg("-i").arg(manifest);
    cmd.args(["-f", "matroska"]);
    cmd.arg("-i").arg(original);
    cmd.args(["-map_metadata", "1"]);
    cmd.args(["-map", "0:v:0", "-map", "1", "-map", "-1:v:0"]);
    cmd.args(["-c", "copy"]);
    cmd.args(["-seek2any", "1", "-g", "24"]);
    cmd.arg("-y").arg(output);
    cmd.kill_on_drop(true);
    cmd
}

/// Short tag for a command in logs: the program's file name.
pub fn program_label(cmd: &Command) -> String {
    let program = Path::new(cmd.as_std().get_program());
    program
        .file_name()
        .unwrap_or(program.as_os_str())
        .to_string_lossy()
        .into_owned()
}

/// Full command line as one string, for the task log.
pub fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn script_arg(name: &str, value: &Path) -> String {
    format!("{}={}", name, value.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_/. -]{1,50}").unwrap()
    }

    #[test]
    fn test_frame_generator_command() {
        let tools = ToolsConfig::default();
        let chunk = Chunk { index: 1, start: 7200, end: 14400, size: 7200 };
        let cmd = frame_generator_command(
            &tools,
            Path::new("/media/show.1080p.mkv"),
            Path::new("/tmp/job/source.lwi"),
            &chunk,
        );
        let args = get_command_args(&cmd);

        assert_eq!(cmd.as_std().get_program(), OsStr::new("vspipe"));
        assert_eq!(
            args,
            vec![
                "-c", "y4m", "/upscale/script.py",
                "-a", "in=/media/show.1080p.mkv",
                "-a", "lwi=/tmp/job/source.lwi",
                "-a", "from=7200",
                "-a", "to=14400",
                "-",
            ]
        );
    }

    #[test]
    fn test_concat_command_maps_video_from_chunks_and_rest_from_original() {
        let tools = ToolsConfig::default();
        let cmd = concat_command(
            &tools,
            Path::new("/tmp/job/files.txt"),
            Path::new("/media/in.mkv"),
            Path::new("/tmp/job/combined.mkv"),
        );
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-f", "concat"));
        assert!(has_flag_with_value(&args, "-safe", "0"));
        assert!(has_flag_with_value(&args, "-i", "/tmp/job/files.txt"));
        assert!(has_flag_with_value(&args, "-i", "/media/in.mkv"));
        assert!(has_flag_with_value(&args, "-map", "0:v:0"));
        assert!(has_flag_with_value(&args, "-map", "1"));
        assert!(has_flag_with_value(&args, "-map", "-1:v:0"));
        assert!(has_flag_with_value(&args, "-map_metadata", "1"));
        assert!(has_flag_with_value(&args, "-c", "copy"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/job/combined.mkv"));
    }

    #[test]
    fn test_frame_count_command() {
        let tools = ToolsConfig::default();
        let cmd = frame_count_command(&tools, Path::new("/media/in.mkv"));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.as_std().get_program(), OsStr::new("ffprobe"));
        assert!(has_flag_with_value(&args, "-show_entries", "stream=nb_read_packets"));
        assert!(has_flag_with_value(&args, "-of", "csv=p=0"));
        assert!(args.contains(&"-count_packets".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/media/in.mkv"));
    }

    #[test]
    fn test_program_label_and_describe() {
        let tools = ToolsConfig {
            ffmpeg: "/opt/ffmpeg/bin/ffmpeg".to_string(),
            ..ToolsConfig::default()
        };
        let cmd = frame_count_command(&tools, Path::new("/in.mkv"));
        assert_eq!(program_label(&cmd), "ffprobe");

        let cmd = encoder_command(&tools, &EncoderConfig::default(), Path::new("/out.mkv"));
        assert_eq!(program_label(&cmd), "ffmpeg");
        assert!(describe(&cmd).starts_with("/opt/ffmpeg/bin/ffmpeg -hide_banner"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Encoder reads stdin, keeps the configured arguments in order and
        // always ends with the output path.
        #[test]
        fn prop_encoder_command_completeness(
            output in path_strategy(),
            input_args in proptest::collection::vec("-[a-z]{1,8}", 0..4),
            encode_args in proptest::collection::vec("[a-z0-9:]{1,8}", 0..8),
            stats_period in 1u64..120,
        ) {
            let tools = ToolsConfig::default();
            let encoder = EncoderConfig {
                input_args: input_args.clone(),
                encode_args: encode_args.clone(),
                stats_period_secs: stats_period,
            };

            let cmd = encoder_command(&tools, &encoder, &PathBuf::from(&output));
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.as_std().get_program(), OsStr::new("ffmpeg"));
            prop_assert_eq!(&args[..input_args.len()], &input_args[..]);
            prop_assert!(has_flag_with_value(&args, "-i", "-"));

            let encode_at = input_args.len() + 2;
            prop_assert_eq!(&args[encode_at..encode_at + encode_args.len()], &encode_args[..]);

            prop_assert!(has_flag_with_value(&args, "-progress", "pipe:1"));
            prop_assert!(has_flag_with_value(&args, "-stats_period", &stats_period.to_string()));
            prop_assert_eq!(&args[args.len() - 2], "-y");
            prop_assert_eq!(&args[args.len() - 1], &output);
        }

        #[test]
        fn prop_frame_generator_range_arguments(
            start in 0u64..1_000_000,
            len in 1u64..10_000,
        ) {
            let chunk = Chunk { index: 0, start, end: start + len, size: len };
            let cmd = frame_generator_command(
                &ToolsConfig::default(),
                Path::new("/in.mkv"),
                Path::new("/cache.lwi"),
                &chunk,
            );
            let args = get_command_args(&cmd);
            let from = format!("from={}", start);
            let to = format!("to={}", start + len);
            prop_assert!(has_flag_with_value(&args, "-a", &from));
            prop_assert!(has_flag_with_value(&args, "-a", &to));
            prop_assert_eq!(args.last().map(String::as_str), Some("-"));
        }
    }
}
