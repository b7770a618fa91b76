//! Command line configuration.

use anyhow::{bail, Context};
use vkstep_render::{parse_frame_list, ScreenshotPlan, SchedulingMode};

/// Demo settings parsed from the command line.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub scheduling: SchedulingMode,
    pub frames_in_flight: usize,
    pub vsync: bool,
    pub validation: bool,
    /// Set when screenshot capture is enabled.
    pub screenshots: Option<ScreenshotPlan>,
    pub help: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            title: "vkstep demo".to_string(),
            width: 1280,
            height: 720,
            scheduling: SchedulingMode::Inline,
            frames_in_flight: 2,
            vsync: false,
            validation: cfg!(debug_assertions),
            screenshots: None,
            help: false,
        }
    }
}

impl DemoConfig {
    pub fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        Self::parse_args(&args)
    }

    /// Parse `args`, skipping the program name.
    pub fn parse_args(args: &[String]) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let mut screenshot = false;
        let mut pattern = None;
        let mut frames = None;
        let mut exit_after = false;

        let mut args = args.iter().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .map(String::as_str)
                    .with_context(|| format!("{arg} expects a value"))
            };
            match arg.as_str() {
                "--threaded" => config.scheduling = SchedulingMode::Threaded,
                "--frames-in-flight" => {
                    let count: usize = value()?.parse().context("invalid --frames-in-flight")?;
                    if !(1..=3).contains(&count) {
                        bail!("--frames-in-flight must be between 1 and 3, got {count}");
                    }
                    config.frames_in_flight = count;
                }
                "--vsync" => config.vsync = true,
                "--validation" => config.validation = true,
                "--no-validation" => config.validation = false,
                "--size" => {
                    let size = value()?;
                    let (width, height) = size
                        .split_once('x')
                        .and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)))
                        .with_context(|| format!("invalid --size {size:?}, expected WIDTHxHEIGHT"))?;
                    config.width = width;
                    config.height = height;
                }
                "-S" | "--screenshot" => screenshot = true,
                "-o" | "--output" => pattern = Some(value()?.to_string()),
                "-f" | "--frames" => frames = Some(parse_frame_list(value()?)?),
                "--exit-after" => exit_after = true,
                "-h" | "--help" => config.help = true,
                other => bail!("unknown argument {other:?}"),
            }
        }

        if screenshot || pattern.is_some() || frames.is_some() {
            let mut plan = ScreenshotPlan::new(
                pattern.unwrap_or_else(|| ScreenshotPlan::DEFAULT_PATTERN.to_string()),
            )
            .with_exit_after(exit_after);
            if let Some(frames) = frames {
                plan = plan.with_frames(frames);
            }
            config.screenshots = Some(plan);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn parse(args: &[&str]) -> anyhow::Result<DemoConfig> {
        let args: Vec<String> = std::iter::once("vkstep-demo")
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        DemoConfig::parse_args(&args)
    }

    #[test]
    fn defaults_without_arguments() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.scheduling, SchedulingMode::Inline);
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.screenshots.is_none());
        assert!(!config.help);
    }

    #[test]
    fn all_flags() {
        let config = parse(&[
            "--threaded",
            "--frames-in-flight",
            "3",
            "--vsync",
            "--size",
            "640x480",
            "-S",
            "-o",
            "shot_{}.png",
            "-f",
            "1,4-5",
            "--exit-after",
        ])
        .unwrap();
        assert_eq!(config.scheduling, SchedulingMode::Threaded);
        assert_eq!(config.frames_in_flight, 3);
        assert!(config.vsync);
        assert_eq!((config.width, config.height), (640, 480));
        let plan = config.screenshots.unwrap();
        assert_eq!(plan.pattern, "shot_{}.png");
        assert_eq!(plan.frames, BTreeSet::from([1, 4, 5]));
        assert!(plan.exit_after);
    }

    #[test]
    fn screenshot_flag_alone_captures_first_frame() {
        let plan = parse(&["-S"]).unwrap().screenshots.unwrap();
        assert_eq!(plan.pattern, ScreenshotPlan::DEFAULT_PATTERN);
        assert_eq!(plan.frames, BTreeSet::from([0]));
        assert!(!plan.exit_after);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert!(parse(&["--frames-in-flight", "4"]).is_err());
        assert!(parse(&["--frames-in-flight"]).is_err());
        assert!(parse(&["--size", "640"]).is_err());
        assert!(parse(&["-f", "x"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}
