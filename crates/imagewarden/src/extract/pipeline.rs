//! Image extraction from CI pipeline and compose definitions.
//!
//! Pipeline formats differ too much to model each one, so this is a
//! line-oriented scan that tracks just enough YAML structure (the chain
//! of enclosing block keys) to tell an `image:` apart from an arbitrary
//! `name:`. Shell commands and Groovy (for `Jenkinsfile`s) are scanned
//! on every line, wherever they appear.

use std::{collections::HashSet, sync::LazyLock};

use camino::Utf8Path;
use regex::Regex;

use super::{Occurrence, unquote};

static KEY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_.-]+)\s*:(?:\s+(.*))?$").unwrap());

static BLOCK_SCALAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[|>][0-9+-]*$").unwrap());

static DOCKER_CLI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bdocker\s+(?:(?:container|image)\s+)?(?:run|create|pull)\b").unwrap()
});

static JENKINS_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\bdocker\.image\(\s*|\bimage\s+)['"]([^'"]+)['"]"#).unwrap()
});

/// `docker run`/`create`/`pull` options that consume the following argument.
const VALUE_FLAGS: &[&str] = &[
    "-a",
    "-c",
    "-e",
    "-h",
    "-l",
    "-m",
    "-p",
    "-u",
    "-v",
    "-w",
    "--add-host",
    "--attach",
    "--cap-add",
    "--cap-drop",
    "--cidfile",
    "--cpus",
    "--device",
    "--dns",
    "--entrypoint",
    "--env",
    "--env-file",
    "--expose",
    "--gpus",
    "--health-cmd",
    "--hostname",
    "--label",
    "--log-driver",
    "--log-opt",
    "--memory",
    "--mount",
    "--name",
    "--network",
    "--platform",
    "--publish",
    "--pull",
    "--restart",
    "--security-opt",
    "--shm-size",
    "--stop-signal",
    "--tmpfs",
    "--ulimit",
    "--user",
    "--volume",
    "--volumes-from",
    "--workdir",
];

/// Pipeline formats that disagree on what a key means.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(super) enum Dialect {
    /// `services:` lists images, as in GitLab CI.
    #[default]
    Generic,
    /// `services:` lists the names of built-in or separately defined
    /// services, as in Travis CI and Bitbucket Pipelines.
    NamedServices,
}

impl Dialect {
    pub(super) fn from_path(path: &Utf8Path) -> Self {
        let name = path.file_name().unwrap_or_default().to_ascii_lowercase();
        if name == ".travis.yml" || name.starts_with("bitbucket-pipelines.") {
            Self::NamedServices
        } else {
            Self::Generic
        }
    }
}

pub(super) fn extract(contents: &str, dialect: Dialect) -> Vec<Occurrence> {
    let mut scanner = Scanner {
        dialect,
        ..Default::default()
    };
    for (idx, line) in contents.lines().enumerate() {
        scanner.line(idx + 1, line);
    }
    scanner.finish()
}

/// An open YAML block: a key whose value is on the following lines.
#[derive(Debug)]
struct Frame {
    indent: usize,
    key: String,
    /// `repository:` and `tag:` found directly under a `source:` block.
    repository: Option<(usize, String)>,
    tag: Option<String>,
    /// The `name:` of the current `services:` item, and whether that
    /// item also has an `image:`.
    service: Option<(usize, String)>,
    service_has_image: bool,
}

impl Frame {
    fn new(indent: usize, key: &str) -> Self {
        Self {
            indent,
            key: key.into(),
            repository: None,
            tag: None,
            service: None,
            service_has_image: false,
        }
    }

    /// Ends the current `services:` item, returning its `name:` if that
    /// is the item's image rather than an alias for it.
    fn end_service(&mut self) -> Option<(usize, String)> {
        let has_image = std::mem::take(&mut self.service_has_image);
        self.service.take().filter(|_| !has_image)
    }
}

#[derive(Debug, Default)]
struct Scanner {
    dialect: Dialect,
    frames: Vec<Frame>,
    /// The indentation of the key owning the block scalar we're in.
    block_scalar: Option<usize>,
    /// A `docker ...` command continued with a trailing backslash,
    /// and the line it started on.
    continuation: Option<(usize, String)>,
    occurrences: Vec<Occurrence>,
    /// Names declared by `containers: - container: <alias>` resources.
    aliases: HashSet<String>,
    /// `container:` values, which are either an image or one of `aliases`.
    containers: Vec<Occurrence>,
}

impl Scanner {
    fn line(&mut self, number: usize, line: &str) {
        let content = line.trim_end();
        let trimmed = content.trim_start();
        let indent = content.len() - trimmed.len();

        if trimmed.is_empty() {
            return;
        }

        if let Some(owner) = self.block_scalar {
            if indent > owner {
                if !trimmed.starts_with('#') {
                    self.shell(number, strip_comment(trimmed));
                }
                return;
            }
            self.block_scalar = None;
            self.flush_continuation();
        }

        if trimmed.starts_with('#') {
            return;
        }

        let text = strip_comment(trimmed);
        self.shell(number, text);
        self.structure(number, indent, text);
    }

    fn finish(mut self) -> Vec<Occurrence> {
        self.flush_continuation();
        self.close_frames(|_| true);

        let aliases = self.aliases;
        self.occurrences.extend(
            self.containers
                .into_iter()
                .filter(|occurrence| !aliases.contains(&occurrence.raw)),
        );
        self.occurrences.sort_by_key(|occurrence| occurrence.line);
        self.occurrences
    }

    fn push(&mut self, line: usize, raw: &str) {
        let raw = unquote(raw);
        if !raw.is_empty() {
            self.occurrences.push(Occurrence::literal(raw, line));
        }
    }

    /// Scans `text` for `docker` CLI invocations and Jenkins pipeline steps.
    fn shell(&mut self, number: usize, text: &str) {
        let (start, command) = match self.continuation.take() {
            Some((start, mut command)) => {
                command.push(' ');
                command.push_str(text);
                (start, command)
            }
            None => (number, text.to_string()),
        };

        if let Some(head) = command.strip_suffix('\\')
            && DOCKER_CLI.is_match(head)
        {
            self.continuation = Some((start, head.trim_end().to_string()));
            return;
        }

        self.scan_command(start, &command);
    }

    fn flush_continuation(&mut self) {
        if let Some((start, command)) = self.continuation.take() {
            self.scan_command(start, &command);
        }
    }

    fn scan_command(&mut self, line: usize, command: &str) {
        for invocation in DOCKER_CLI.find_iter(command) {
            if let Some(image) = cli_image(&command[invocation.end()..]) {
                self.push(line, image);
            }
        }

        for caps in JENKINS_IMAGE.captures_iter(command) {
            if let Some(image) = caps.get(1) {
                self.push(line, image.as_str());
            }
        }
    }

    /// Closes every open block matching `closes`, innermost first.
    fn close_frames(&mut self, closes: impl Fn(&Frame) -> bool) {
        while let Some(mut frame) = self.frames.pop_if(|frame| closes(frame)) {
            if let Some((line, name)) = frame.end_service() {
                self.push(line, &name);
            }

            if frame.key == "source"
                && let Some((line, repository)) = frame.repository
            {
                let image = match frame.tag {
                    Some(tag) => format!("{repository}:{tag}"),
                    None => repository,
                };
                self.push(line, &image);
            }
        }
    }

    fn structure(&mut self, number: usize, indent: usize, text: &str) {
        // Sequence items (`- value` or `- key: value`): keys inside the item
        // sit to the right of the dash.
        let (is_item, body, key_indent) = match text.strip_prefix('-') {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                let body = rest.trim_start();
                (true, body, indent + (text.len() - body.len()))
            }
            _ => (false, text, indent),
        };

        // Sequence items may sit at the same indentation as their parent key.
        if is_item {
            self.close_frames(|frame| frame.indent > indent);
        } else {
            self.close_frames(|frame| frame.indent >= indent);
        }

        if is_item {
            let ended = self
                .frames
                .last_mut()
                .filter(|frame| frame.key == "services")
                .and_then(|frame| frame.end_service());
            if let Some((line, name)) = ended {
                self.push(line, &name);
            }
        }

        let images_in_services = self.dialect == Dialect::Generic;
        let parent = self.frames.last().map(|frame| frame.key.as_str());

        let Some(caps) = KEY_VALUE.captures(body) else {
            if is_item && images_in_services && parent == Some("services") && !body.is_empty() {
                self.push(number, body);
            }
            return;
        };

        let key = caps.get(1).map_or("", |m| m.as_str());
        let value = caps
            .get(2)
            .map(|m| m.as_str().trim())
            .filter(|value| !value.is_empty());

        if let Some(value) = value {
            match key {
                "container" if parent == Some("containers") => {
                    self.aliases.insert(unquote(value).into());
                }
                "container" if !value.starts_with('{') => {
                    let raw = unquote(value);
                    if !raw.is_empty() {
                        self.containers.push(Occurrence::literal(raw, number));
                    }
                }
                // CircleCI `machine:` images are VM images.
                "image" if !value.starts_with('{') && parent != Some("machine") => {
                    if parent == Some("services")
                        && let Some(frame) = self.frames.last_mut()
                    {
                        frame.service_has_image = true;
                    }
                    self.push(number, value)
                }
                "name" if parent == Some("image") => self.push(number, value),
                "name" if images_in_services && parent == Some("services") => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.service = Some((number, unquote(value).into()));
                    }
                }
                "services" if images_in_services && value.starts_with('[') => {
                    let items = value.trim_start_matches('[').trim_end_matches(']');
                    for item in items.split(',') {
                        self.push(number, item);
                    }
                }
                "uses" => {
                    if let Some(image) = unquote(value).strip_prefix("docker://") {
                        self.push(number, image);
                    }
                }
                "repository" | "tag" if parent == Some("source") => {
                    if let Some(frame) = self.frames.last_mut() {
                        let value = unquote(value).to_string();
                        if key == "repository" {
                            frame.repository = Some((number, value));
                        } else {
                            frame.tag = Some(value);
                        }
                    }
                }
                _ => {}
            }
        }

        match value {
            None => self.frames.push(Frame::new(key_indent, key)),
            Some(value) if BLOCK_SCALAR.is_match(value) => self.block_scalar = Some(key_indent),
            Some(_) => {}
        }
    }
}

/// Returns the image operand of a `docker run`/`create`/`pull`
/// invocation, given everything after the subcommand.
fn cli_image(args: &str) -> Option<&str> {
    let mut tokens = args.split_whitespace();

    while let Some(token) = tokens.next() {
        if matches!(token, "&&" | "||" | "|" | ";") {
            return None;
        }

        if token.starts_with('-') {
            if !token.contains('=') && VALUE_FLAGS.contains(&token) {
                tokens.next();
            }
            continue;
        }

        let image = token
            .trim_start_matches(['"', '\''])
            .trim_end_matches(['"', '\'', ';', ')']);
        return (!image.is_empty()).then_some(image);
    }

    None
}

/// Strips a trailing `# comment` that isn't inside quotes.
fn strip_comment(text: &str) -> &str {
    let mut quote = None;
    let mut after_space = false;

    for (idx, c) in text.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(open), c) if c == open => quote = None,
            (None, '#') if after_space => return text[..idx].trim_end(),
            _ => {}
        }
        after_space = c.is_whitespace();
    }

    text
}
