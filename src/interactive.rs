//! Interactive prompt loop.
//!
//! Lines are either a new prompt or a slash command that adjusts the
//! sampling options for subsequent runs. Commands keep applying until a
//! plain prompt line (or an empty line reusing the previous prompt)
//! triggers the next generation.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::sampling::{aspect_ratio_names, lookup_aspect_ratio, AspectRatio, SamplingOptions};

const READ_PROMPT: &str = "Next prompt (press Ctrl-C or type /q to exit): ";
const IMAGE_PROMPT: &str = "Next input image (leave empty to keep the current one, /q to exit): ";

const USAGE: &str = "Usage: leave this field empty to repeat the prompt
or write a command starting with a slash:
- '/ar <ratio>|auto' sets the aspect ratio of the output
- '/h <height>|auto' sets the output height (width follows the input image)
- '/g <guidance>' sets the guidance
- '/s <seed>' sets the next seed
- '/n <steps>' sets the number of steps
- '/q' quits";

/// Where interactive lines come from. Swapped for a scripted source in tests.
pub trait LineSource {
    /// The next line, or `None` once the source is exhausted.
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>>;
}

/// Reads from stdin, echoing the prompt to stdout first.
pub struct StdinSource;

impl LineSource for StdinSource {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

/// Replays a fixed list of lines.
pub struct ScriptedSource {
    lines: std::vec::IntoIter<String>,
}

impl ScriptedSource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines
                .into_iter()
                .map(Into::into)
                .collect::<Vec<_>>()
                .into_iter(),
        }
    }
}

impl LineSource for ScriptedSource {
    fn read_line(&mut self, _prompt: &str) -> io::Result<Option<String>> {
        Ok(self.lines.next())
    }
}

/// Reads lines until one yields a prompt to run with, applying slash
/// commands to `opts` along the way. Returns `false` on `/q` or when the
/// source runs dry.
pub fn read_options(source: &mut dyn LineSource, opts: &mut SamplingOptions) -> Result<bool> {
    loop {
        let Some(line) = source.read_line(READ_PROMPT)? else {
            return Ok(false);
        };
        let line = line.trim();
        if line.is_empty() {
            // Reuse the previous prompt as-is.
            return Ok(true);
        }
        if let Some(rest) = line.strip_prefix('/') {
            if rest == "q" {
                return Ok(false);
            }
            if !apply_command(rest, opts) {
                println!("{USAGE}");
            }
            continue;
        }
        opts.prompt = line.to_string();
        return Ok(true);
    }
}

/// Applies one slash command body. Returns `false` when the command is
/// unknown or its argument fails to parse; the options stay untouched then.
fn apply_command(body: &str, opts: &mut SamplingOptions) -> bool {
    let (cmd, arg) = match body.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (body, ""),
    };
    match cmd {
        "ar" => {
            if arg == "auto" {
                opts.width = None;
                opts.height = None;
                println!("Setting resolution to match the input image");
                return true;
            }
            match lookup_aspect_ratio(arg) {
                Some(AspectRatio::Fixed(w, h)) => {
                    opts.width = Some(w);
                    opts.height = Some(h);
                    println!("Setting resolution to {w} x {h}");
                    true
                }
                Some(AspectRatio::MatchInput) => {
                    opts.width = None;
                    opts.height = None;
                    println!("Setting resolution to match the input image");
                    true
                }
                None => {
                    let known: Vec<&str> = aspect_ratio_names().collect();
                    println!("unknown aspect ratio '{arg}', expected one of {known:?} or auto");
                    false
                }
            }
        }
        "h" => {
            if arg == "auto" {
                opts.height = None;
                opts.width = None;
                println!("Setting resolution to match the input image");
                return true;
            }
            match arg.parse::<usize>() {
                Ok(h) if h >= 16 => {
                    let h = 16 * (h / 16);
                    opts.height = Some(h);
                    opts.width = None;
                    println!("Setting height to {h} (width follows the input image)");
                    true
                }
                _ => false,
            }
        }
        "g" => match arg.parse::<f64>() {
            Ok(g) => {
                opts.guidance = g;
                println!("Setting guidance to {g}");
                true
            }
            Err(_) => false,
        },
        "s" => match arg.parse::<u64>() {
            Ok(s) => {
                opts.seed = Some(s);
                println!("Setting seed to {s}");
                true
            }
            Err(_) => false,
        },
        "n" => match arg.parse::<usize>() {
            Ok(n) if n >= 1 => {
                opts.num_steps = n;
                println!("Setting number of steps to {n}");
                true
            }
            _ => false,
        },
        _ => false,
    }
}

/// Reads the conditioning image for the next generation. An empty line
/// keeps the current image; an invalid path reports the problem and asks
/// again. Returns `false` on `/q` or an exhausted source.
pub fn read_img_cond_path(source: &mut dyn LineSource, opts: &mut SamplingOptions) -> Result<bool> {
    loop {
        let Some(line) = source.read_line(IMAGE_PROMPT)? else {
            return Ok(false);
        };
        let line = line.trim();
        if line.is_empty() {
            return Ok(true);
        }
        if line == "/q" {
            return Ok(false);
        }
        match validate_img_cond_path(line) {
            Ok(_) => {
                opts.img_cond_path = line.to_string();
                println!("Setting input image to {line}");
                return Ok(true);
            }
            Err(e) => println!("{e}"),
        }
    }
}

/// Checks that a conditioning image path exists and carries a supported
/// extension before anything tries to decode it.
pub fn validate_img_cond_path(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    if !p.is_file() {
        return Err(Error::InvalidOptions(format!(
            "conditioning image '{path}' does not exist"
        )));
    }
    let ext = p
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg" | "png" | "webp") => Ok(p.to_path_buf()),
        _ => Err(Error::InvalidOptions(format!(
            "conditioning image '{path}' must be a jpg, png or webp file"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::ModelVariant;

    fn opts() -> SamplingOptions {
        SamplingOptions::new(ModelVariant::Dev, "a cat", "in.png")
    }

    fn run(lines: &[&str], opts: &mut SamplingOptions) -> bool {
        let mut source = ScriptedSource::new(lines.iter().copied());
        read_options(&mut source, opts).unwrap()
    }

    #[test]
    fn plain_line_replaces_the_prompt() {
        let mut o = opts();
        assert!(run(&["a dog on the beach"], &mut o));
        assert_eq!(o.prompt, "a dog on the beach");
    }

    #[test]
    fn empty_line_keeps_the_previous_prompt() {
        let mut o = opts();
        assert!(run(&["  "], &mut o));
        assert_eq!(o.prompt, "a cat");
    }

    #[test]
    fn aspect_ratio_command_sets_both_dimensions() {
        let mut o = opts();
        assert!(run(&["/ar 16:9", "go"], &mut o));
        assert_eq!((o.width, o.height), (Some(1328), Some(800)));
        assert_eq!(o.prompt, "go");
    }

    #[test]
    fn auto_clears_dimensions() {
        let mut o = opts();
        assert!(run(&["/ar 16:9", "/ar auto", "go"], &mut o));
        assert_eq!((o.width, o.height), (None, None));
    }

    #[test]
    fn height_command_rounds_to_the_grid() {
        let mut o = opts();
        assert!(run(&["/h 500", "go"], &mut o));
        assert_eq!(o.height, Some(496));
        assert_eq!(o.width, None);
    }

    #[test]
    fn numeric_commands_update_options() {
        let mut o = opts();
        assert!(run(&["/g 3.5", "/s 42", "/n 8", "go"], &mut o));
        assert_eq!(o.guidance, 3.5);
        assert_eq!(o.seed, Some(42));
        assert_eq!(o.num_steps, 8);
    }

    #[test]
    fn unknown_command_leaves_options_untouched() {
        let mut o = opts();
        assert!(run(&["/bogus 1", "go"], &mut o));
        assert_eq!(o.guidance, ModelVariant::Dev.default_guidance());
        assert_eq!((o.width, o.height), (None, None));
    }

    #[test]
    fn bad_argument_is_ignored() {
        let mut o = opts();
        assert!(run(&["/s not-a-number", "go"], &mut o));
        assert_eq!(o.seed, None);
    }

    #[test]
    fn quit_and_exhaustion_both_stop_the_loop() {
        let mut o = opts();
        assert!(!run(&["/q"], &mut o));
        assert!(!run(&[], &mut o));
    }

    #[test]
    fn image_prompt_keeps_the_current_path_on_an_empty_line() {
        let mut o = opts();
        let mut source = ScriptedSource::new([""]);
        assert!(read_img_cond_path(&mut source, &mut o).unwrap());
        assert_eq!(o.img_cond_path, "in.png");
    }

    #[test]
    fn image_prompt_retries_until_the_path_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("next.png");
        std::fs::write(&good, b"").unwrap();
        let good = good.to_str().unwrap().to_string();

        let mut o = opts();
        let mut source = ScriptedSource::new(["missing.png", good.as_str()]);
        assert!(read_img_cond_path(&mut source, &mut o).unwrap());
        assert_eq!(o.img_cond_path, good);
    }

    #[test]
    fn image_prompt_stops_on_quit_or_exhaustion() {
        let mut o = opts();
        let mut source = ScriptedSource::new(["/q"]);
        assert!(!read_img_cond_path(&mut source, &mut o).unwrap());
        let mut source = ScriptedSource::new(Vec::<String>::new());
        assert!(!read_img_cond_path(&mut source, &mut o).unwrap());
    }

    #[test]
    fn conditioning_path_must_exist_with_a_known_extension() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("cond.png");
        std::fs::write(&good, b"").unwrap();
        let bad_ext = dir.path().join("cond.txt");
        std::fs::write(&bad_ext, b"").unwrap();

        assert!(validate_img_cond_path(good.to_str().unwrap()).is_ok());
        assert!(validate_img_cond_path(bad_ext.to_str().unwrap()).is_err());
        assert!(validate_img_cond_path("missing.png").is_err());
    }
}
