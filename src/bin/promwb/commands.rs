//! Dot commands and queries typed at the prompt.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use promql_workbench::clock::{format_ms, parse_duration_ms};
use promql_workbench::error::{Error, Result};
use promql_workbench::mutate::SeriesFilter;
use promql_workbench::query_engine::QueryValue;
use promql_workbench::session::{IngestReport, LoadOptions, Session};
use promql_workbench::storage::Series;
use promql_workbench::TimestampMode;

pub const HELP: &str = "\
<expr>                                  evaluate a PromQL expression at the session clock
.at <instant> <expr>                    evaluate at a given instant
.range <start> <end> <step> <expr>      evaluate over a range
.load <file> [filter=RE] [ts=MODE]      load exposition text
.import <file> [filter=RE] [ts=MODE]    import a query API JSON response
.scrape <url> [count=N] [delay=DUR] [filter=RE] [ts=MODE]
                                        fetch and load an exposition endpoint
.save <file|-> [filter=RE] [ts=MODE]    write the store as exposition text
.drop <regex>                           remove series whose signature matches
.keep <regex>                           remove series whose signature does not match
.rename <old> <new>                     rename a metric
.seed <metric> [steps=N] [step=DUR]     backfill synthetic history
.rules [spec]                           activate rule files, or list the active rules
.eval [instant]                         run one rule pass
.pin <instant>  .unpin  .now            control the evaluation clock
.metrics  .labels [name]  .clear        inspect or empty the store
.help  .quit
MODE is keep, remove or an instant (RFC3339, unix seconds, now, now-<dur>).";

const DEFAULT_SEED_STEPS: usize = 10;
const DEFAULT_SEED_STEP: &str = "1m";
const DEFAULT_SCRAPE_DELAY: &str = "15s";

/// What the loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// A parsed prompt line. Instants stay unparsed until execution so they
/// resolve against the clock at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Query(String),
    At { at: String, query: String },
    Range { start: String, end: String, step: String, query: String },
    Load { path: PathBuf, options: IngestOptions },
    Import { path: PathBuf, options: IngestOptions },
    Scrape { url: String, count: usize, delay: String, options: IngestOptions },
    Save { path: Option<PathBuf>, options: IngestOptions },
    Drop(String),
    Keep(String),
    Rename { old: String, new: String },
    Seed { metric: String, steps: usize, step: String },
    Rules(Option<String>),
    Eval(Option<String>),
    Pin(String),
    Unpin,
    Now,
    Metrics,
    Labels(Option<String>),
    Clear,
    Help,
    Quit,
}

/// `filter=` and `ts=` arguments shared by load and save commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOptions {
    pub filter: Option<String>,
    pub ts: Option<String>,
}

/// Separate `key=value` arguments with an allowed key from positional ones.
fn split_options<'a>(args: &[&'a str], allowed: &[&str]) -> (Vec<&'a str>, BTreeMap<&'a str, &'a str>) {
    let mut positional = Vec::new();
    let mut options = BTreeMap::new();
    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) if allowed.contains(&key) => {
                options.insert(key, value);
            }
            _ => positional.push(*arg),
        }
    }
    (positional, options)
}

/// Split off the first `n` words and return them with the trimmed remainder.
fn leading_words(mut input: &str, n: usize) -> (Vec<&str>, &str) {
    let mut words = Vec::with_capacity(n);
    for _ in 0..n {
        input = input.trim_start();
        if input.is_empty() {
            break;
        }
        let end = input.find(char::is_whitespace).unwrap_or(input.len());
        words.push(&input[..end]);
        input = &input[end..];
    }
    (words, input.trim())
}

fn ingest_options(options: &BTreeMap<&str, &str>) -> IngestOptions {
    IngestOptions {
        filter: options.get("filter").map(|s| (*s).to_string()),
        ts: options.get("ts").map(|s| (*s).to_string()),
    }
}

fn one_path(positional: &[&str], usage: &str) -> Result<PathBuf> {
    match positional {
        [path] => Ok(PathBuf::from(path)),
        _ => Err(Error::Usage(format!("usage: {usage}"))),
    }
}

fn parse_count(value: Option<&&str>, default: usize, key: &str) -> Result<usize> {
    value.map_or(Ok(default), |v| {
        v.parse().map_err(|_| Error::Usage(format!("{key} must be a non-negative integer, got {v:?}")))
    })
}

/// Parse one prompt line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let Some(body) = line.strip_prefix('.') else {
        return Ok(Some(Command::Query(line.to_string())));
    };

    let (name, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    let rest = rest.trim();
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match name {
        "at" => match leading_words(rest, 1) {
            (words, query) if words.len() == 1 && !query.is_empty() => {
                Command::At { at: words[0].to_string(), query: query.to_string() }
            }
            _ => return Err(Error::Usage("usage: .at <instant> <expr>".into())),
        },
        "range" => match leading_words(rest, 3) {
            (words, query) if words.len() == 3 && !query.is_empty() => Command::Range {
                start: words[0].to_string(),
                end: words[1].to_string(),
                step: words[2].to_string(),
                query: query.to_string(),
            },
            _ => return Err(Error::Usage("usage: .range <start> <end> <step> <expr>".into())),
        },
        "load" | "import" => {
            let (positional, options) = split_options(&args, &["filter", "ts"]);
            let path = one_path(&positional, &format!(".{name} <file> [filter=RE] [ts=MODE]"))?;
            let options = ingest_options(&options);
            if name == "load" {
                Command::Load { path, options }
            } else {
                Command::Import { path, options }
            }
        }
        "scrape" => {
            let (positional, options) = split_options(&args, &["filter", "ts", "count", "delay"]);
            let [url] = positional.as_slice() else {
                return Err(Error::Usage("usage: .scrape <url> [count=N] [delay=DUR]".into()));
            };
            Command::Scrape {
                url: (*url).to_string(),
                count: parse_count(options.get("count"), 1, "count")?,
                delay: options.get("delay").copied().unwrap_or(DEFAULT_SCRAPE_DELAY).to_string(),
                options: ingest_options(&options),
            }
        }
        "save" => {
            let (positional, options) = split_options(&args, &["filter", "ts"]);
            let path = one_path(&positional, ".save <file|-> [filter=RE] [ts=MODE]")?;
            let path = if path.as_os_str() == "-" { None } else { Some(path) };
            Command::Save { path, options: ingest_options(&options) }
        }
        "drop" | "keep" if rest.is_empty() => {
            return Err(Error::Usage(format!("usage: .{name} <regex>")));
        }
        "drop" => Command::Drop(rest.to_string()),
        "keep" => Command::Keep(rest.to_string()),
        "rename" => match args.as_slice() {
            [old, new] => Command::Rename { old: (*old).to_string(), new: (*new).to_string() },
            _ => return Err(Error::Usage("usage: .rename <old> <new>".into())),
        },
        "seed" => {
            let (positional, options) = split_options(&args, &["steps", "step"]);
            let [metric] = positional.as_slice() else {
                return Err(Error::Usage("usage: .seed <metric> [steps=N] [step=DUR]".into()));
            };
            Command::Seed {
                metric: (*metric).to_string(),
                steps: parse_count(options.get("steps"), DEFAULT_SEED_STEPS, "steps")?,
                step: options.get("step").copied().unwrap_or(DEFAULT_SEED_STEP).to_string(),
            }
        }
        "rules" => Command::Rules((!rest.is_empty()).then(|| rest.to_string())),
        "eval" => Command::Eval((!rest.is_empty()).then(|| rest.to_string())),
        "pin" if rest.is_empty() => return Err(Error::Usage("usage: .pin <instant>".into())),
        "pin" => Command::Pin(rest.to_string()),
        "unpin" => Command::Unpin,
        "now" => Command::Now,
        "metrics" => Command::Metrics,
        "labels" => Command::Labels((!rest.is_empty()).then(|| rest.to_string())),
        "clear" => Command::Clear,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(Error::Usage(format!("unknown command .{other}, try .help"))),
    };
    Ok(Some(command))
}

fn load_options(session: &Session, options: &IngestOptions) -> Result<LoadOptions> {
    Ok(LoadOptions {
        filter: options.filter.as_deref().map(SeriesFilter::new).transpose()?,
        mode: options
            .ts
            .as_deref()
            .map(|ts| TimestampMode::parse(ts, session.now_ms()))
            .transpose()?
            .unwrap_or_default(),
    })
}

fn report_ingest(out: &mut impl Write, report: &IngestReport) -> Result<()> {
    let load = &report.load;
    writeln!(
        out,
        "loaded {} samples into {} metrics ({} filtered out)",
        load.loaded, load.metrics, load.filtered_out
    )?;
    match &report.eval {
        Some(Ok(eval)) => writeln!(
            out,
            "rules: {} evaluated, {} samples added, {} alerts fired",
            eval.rules, eval.samples_added, eval.alerts_fired
        )?,
        Some(Err(err)) => writeln!(
            out,
            "rule pass aborted at {err} ({} rules evaluated, {} samples added)",
            err.partial.rules, err.partial.samples_added
        )?,
        None => {}
    }
    Ok(())
}

fn write_series(out: &mut impl Write, series: &[Series]) -> Result<()> {
    if series.is_empty() {
        writeln!(out, "(empty result)")?;
    } else {
        write!(out, "{}", QueryValue::Matrix(series.to_vec()))?;
    }
    Ok(())
}

fn write_value(out: &mut impl Write, value: &QueryValue) -> Result<()> {
    match value {
        QueryValue::Vector(v) if v.is_empty() => writeln!(out, "(empty result)")?,
        QueryValue::Matrix(m) => write_series(out, m)?,
        other => write!(out, "{other}")?,
    }
    Ok(())
}

/// Run one command against the session, writing its output to `out`.
pub async fn execute(session: &mut Session, command: Command, out: &mut impl Write) -> Result<Flow> {
    match command {
        Command::Query(query) => write_value(out, &session.query(&query, None)?)?,
        Command::At { at, query } => {
            let at = session.parse_instant(&at)?;
            write_value(out, &session.query(&query, Some(at))?)?;
        }
        Command::Range { start, end, step, query } => {
            let start = session.parse_instant(&start)?;
            let end = session.parse_instant(&end)?;
            let step = parse_duration_ms(&step)?;
            write_series(out, &session.query_range(&query, start, end, step)?)?;
        }
        Command::Load { path, options } => {
            let options = load_options(session, &options)?;
            report_ingest(out, &session.load_file(&path, &options)?)?;
        }
        Command::Import { path, options } => {
            let options = load_options(session, &options)?;
            let input = fs::read_to_string(&path)?;
            report_ingest(out, &session.import_json(&input, &options)?)?;
        }
        Command::Scrape { url, count, delay, options } => {
            let options = load_options(session, &options)?;
            let delay = Duration::from_millis(parse_duration_ms(&delay)?.unsigned_abs());
            for report in session.scrape(&url, count, delay, &options).await? {
                report_ingest(out, &report)?;
            }
        }
        Command::Save { path, options } => {
            let options = load_options(session, &options)?;
            let filter = options.filter.as_ref();
            match path {
                Some(path) => {
                    let saved = session.save_file(&path, filter, options.mode)?;
                    writeln!(
                        out,
                        "saved {} samples from {} metrics to {}",
                        saved.samples,
                        saved.metrics,
                        path.display()
                    )?;
                }
                None => write!(out, "{}", session.save(filter, options.mode)?.text)?,
            }
        }
        Command::Drop(pattern) => {
            let stats = session.drop_series(&SeriesFilter::new(&pattern)?);
            writeln!(out, "removed {} samples, {} remain", stats.removed, stats.remaining)?;
        }
        Command::Keep(pattern) => {
            let stats = session.keep_series(&SeriesFilter::new(&pattern)?);
            writeln!(out, "removed {} samples, {} remain", stats.removed, stats.remaining)?;
        }
        Command::Rename { old, new } => {
            let moved = session.rename(&old, &new)?;
            writeln!(out, "renamed {old} to {new} ({moved} samples)")?;
        }
        Command::Seed { metric, steps, step } => {
            let seeded = session.seed(&metric, steps, parse_duration_ms(&step)?)?;
            writeln!(out, "seeded {} samples across {} series", seeded.samples, seeded.series)?;
        }
        Command::Rules(Some(spec)) => {
            let set = session.activate_rules(&spec)?;
            writeln!(out, "activated {} rules from {} files", set.rule_count(), set.files.len())?;
        }
        Command::Rules(None) => match session.rules() {
            Some(set) => {
                for group in &set.groups {
                    writeln!(out, "{} ({})", group.name, group.file.display())?;
                    for rule in &group.rules {
                        writeln!(out, "  {:?} {}: {}", rule.kind, rule.name, rule.expr)?;
                    }
                }
            }
            None => writeln!(out, "no rules are active")?,
        },
        Command::Eval(at) => {
            let at = at.map(|at| session.parse_instant(&at)).transpose()?;
            let eval = session.evaluate_rules(at)?;
            writeln!(
                out,
                "rules: {} evaluated, {} samples added, {} alerts fired",
                eval.rules, eval.samples_added, eval.alerts_fired
            )?;
        }
        Command::Pin(at) => {
            let at = session.parse_instant(&at)?;
            session.pin(at);
            writeln!(out, "pinned at {}", format_ms(at))?;
        }
        Command::Unpin => {
            session.unpin();
            writeln!(out, "following the wall clock")?;
        }
        Command::Now => {
            let state = if session.pinned().is_some() { "pinned" } else { "wall clock" };
            writeln!(out, "{} ({state})", format_ms(session.now_ms()))?;
        }
        Command::Metrics => {
            for name in session.metric_names() {
                let store = session.store();
                writeln!(
                    out,
                    "{name} ({} series, {} samples)",
                    store.series_count(&name),
                    store.bucket_len(&name)
                )?;
            }
        }
        Command::Labels(None) => writeln!(out, "{}", session.label_names().join(" "))?,
        Command::Labels(Some(name)) => writeln!(out, "{}", session.label_values(&name).join(" "))?,
        Command::Clear => {
            session.clear();
            writeln!(out, "store cleared")?;
        }
        Command::Help => writeln!(out, "{HELP}")?,
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}
