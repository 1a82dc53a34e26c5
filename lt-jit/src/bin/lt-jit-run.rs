use std::io;

use jit::{
    AbiType, Aarch64, Arena, Assembler, Assembly, CodeReport, JitConfig, ReturnKind, Target,
    X86_64, asm::parse_int, assemble, config::parse_size, logging,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliConfig {
    source: Option<String>,
    target: Option<String>,
    dump: bool,
    json: bool,
    call: Option<Vec<i64>>,
    arena_bytes: Option<usize>,
    fixed_arena: bool,
    repl: bool,
    help: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetChoice {
    Host,
    X86Sysv,
    X86Win64,
    Aarch64,
    Apple,
}

impl TargetChoice {
    fn parse(name: Option<&str>) -> Result<Self, String> {
        match name.unwrap_or("host") {
            "host" => Ok(TargetChoice::Host),
            "x86_64-sysv" | "x86_64" => Ok(TargetChoice::X86Sysv),
            "x86_64-win64" => Ok(TargetChoice::X86Win64),
            "aarch64-aapcs64" | "aarch64" => Ok(TargetChoice::Aarch64),
            "aarch64-apple" => Ok(TargetChoice::Apple),
            other => Err(format!(
                "unknown target '{other}' (host, x86_64-sysv, x86_64-win64, aarch64-aapcs64, aarch64-apple)"
            )),
        }
    }
}

/// Runs `$body` with `$target` bound to the chosen concrete target.
macro_rules! with_target {
    ($choice:expr, $target:ident => $body:expr) => {
        match $choice {
            TargetChoice::Host => {
                let $target = jit::host();
                $body
            }
            TargetChoice::X86Sysv => {
                let $target = X86_64::sysv();
                $body
            }
            TargetChoice::X86Win64 => {
                let $target = X86_64::win64();
                $body
            }
            TargetChoice::Aarch64 => {
                let $target = Aarch64::aapcs64();
                $body
            }
            TargetChoice::Apple => {
                let $target = Aarch64::apple();
                $body
            }
        }
    };
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    let config = arena_config(&cli).map_err(io::Error::other)?;
    let choice = TargetChoice::parse(cli.target.as_deref()).map_err(io::Error::other)?;
    if cli.repl {
        return with_target!(choice, target => run_repl(target, &config));
    }
    let Some(path) = cli.source.as_ref() else {
        return Err(Box::new(io::Error::other("missing source path")));
    };
    let source = std::fs::read_to_string(path)?;
    with_target!(choice, target => run_source(target, &config, &source, &cli))
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    if args.is_empty() {
        cfg.repl = true;
        return Ok(cfg);
    }
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--target" => {
                let name = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --target".to_string())?;
                cfg.target = Some(name.clone());
                index += 2;
            }
            "--dump" => {
                cfg.dump = true;
                index += 1;
            }
            "--json" => {
                cfg.json = true;
                index += 1;
            }
            "--call" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --call".to_string())?;
                cfg.call = Some(parse_call_args(raw)?);
                index += 2;
            }
            "--arena-bytes" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --arena-bytes".to_string())?;
                let value =
                    parse_size(raw).ok_or_else(|| format!("invalid --arena-bytes value '{raw}'"))?;
                cfg.arena_bytes = Some(value);
                index += 2;
            }
            "--fixed-arena" => {
                cfg.fixed_arena = true;
                index += 1;
            }
            "--repl" => {
                cfg.repl = true;
                index += 1;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.source.is_some() {
                    return Err("multiple source paths provided".to_string());
                }
                cfg.source = Some(path.to_string());
                index += 1;
            }
        }
    }

    if cfg.repl {
        if cfg.source.is_some() {
            return Err("repl mode does not accept a source path".to_string());
        }
        if cfg.dump || cfg.json || cfg.call.is_some() {
            return Err("repl mode cannot be combined with --dump/--json/--call".to_string());
        }
    } else if cfg.source.is_none() && !cfg.help {
        cfg.repl = true;
    }
    Ok(cfg)
}

fn parse_call_args(raw: &str) -> Result<Vec<i64>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|token| {
            let token = token.trim();
            parse_int(token).ok_or_else(|| format!("invalid --call argument '{token}'"))
        })
        .collect()
}

/// Environment first, then flags.
fn arena_config(cli: &CliConfig) -> Result<JitConfig, String> {
    let mut config = JitConfig::from_env()?;
    if let Some(bytes) = cli.arena_bytes {
        config.arena_bytes = bytes;
        config.max_arena_bytes = config.max_arena_bytes.max(bytes);
    }
    if cli.fixed_arena {
        config.growable = false;
        config.max_arena_bytes = config.arena_bytes;
    }
    config.validate()?;
    Ok(config)
}

fn print_usage() {
    println!("Usage:");
    println!("  lt-jit-run                          (defaults to REPL)");
    println!("  lt-jit-run [--target NAME] --repl");
    println!("  lt-jit-run [--target NAME] [--dump] [--json] [--call A,B,...] <source.lt>");
    println!("  lt-jit-run [--arena-bytes N] [--fixed-arena] <source.lt>");
    println!();
    println!("targets: host, x86_64-sysv, x86_64-win64, aarch64-aapcs64, aarch64-apple");
    println!("env: LT_JIT_ARENA_BYTES, LT_JIT_MAX_ARENA_BYTES, LT_JIT_FIXED_ARENA, RUST_LOG");
}

#[derive(Serialize)]
struct RunReport<'a> {
    #[serde(flatten)]
    code: CodeReport,
    args: &'a [AbiType],
    returns: Option<ReturnKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
}

fn run_source<T: Target>(
    target: T,
    config: &JitConfig,
    source: &str,
    cli: &CliConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = target.name();
    let assembly = assemble(target, Arena::from_config(config)?, source)?;
    info!(
        "{} {} {} bytes, {} labels",
        logging::category_emit(),
        logging::target_label(name),
        assembly.code.len(),
        assembly.labels.len()
    );
    let result = match cli.call.as_deref() {
        Some(args) => Some(call_function(&assembly, args).map_err(io::Error::other)?),
        None => None,
    };
    if cli.json {
        let report = RunReport {
            code: assembly.code.report(),
            args: &assembly.args,
            returns: assembly.returns,
            result,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if cli.dump {
        print_dump(&assembly);
    }
    if let Some(result) = result {
        info!("{} => {result}", logging::category_run());
        println!("{result}");
    }
    Ok(())
}

fn print_dump(assembly: &Assembly) {
    for (name, offset) in &assembly.labels {
        println!("{offset:#06x} <{name}>");
    }
    for (row, chunk) in assembly.code.bytes().chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        println!("{:06x}  {}", row * 16, hex.join(" "));
    }
}

macro_rules! invoke {
    ($code:expr, $ret:ty, $args:expr) => {{
        let code = $code;
        let args = $args;
        // SAFETY: the code was compiled for the host with `args.len()` word
        // arguments and a `$ret` result.
        unsafe {
            match args.len() {
                0 => code.entry_as::<extern "C" fn() -> $ret>()(),
                1 => code.entry_as::<extern "C" fn(i64) -> $ret>()(args[0]),
                2 => code.entry_as::<extern "C" fn(i64, i64) -> $ret>()(args[0], args[1]),
                3 => code.entry_as::<extern "C" fn(i64, i64, i64) -> $ret>()(
                    args[0], args[1], args[2],
                ),
                4 => code.entry_as::<extern "C" fn(i64, i64, i64, i64) -> $ret>()(
                    args[0], args[1], args[2], args[3],
                ),
                5 => code.entry_as::<extern "C" fn(i64, i64, i64, i64, i64) -> $ret>()(
                    args[0], args[1], args[2], args[3], args[4],
                ),
                6 => code.entry_as::<extern "C" fn(i64, i64, i64, i64, i64, i64) -> $ret>()(
                    args[0], args[1], args[2], args[3], args[4], args[5],
                ),
                n => return Err(format!("--call supports at most 6 arguments, got {n}")),
            }
        }
    }};
}

/// Calls host code with integer arguments and formats its result.
fn call_function(assembly: &Assembly, args: &[i64]) -> Result<String, String> {
    let host = jit::host();
    if assembly.code.target() != host.name() {
        return Err(format!(
            "cannot call {} code on a {} host",
            assembly.code.target(),
            host.name()
        ));
    }
    if assembly.args.len() != args.len() {
        return Err(format!(
            "function declares {} arguments, --call passed {}",
            assembly.args.len(),
            args.len()
        ));
    }
    if assembly.args.iter().any(|ty| ty.is_float()) {
        return Err("--call only passes integer and pointer arguments".to_string());
    }
    let code = &assembly.code;
    Ok(match assembly.returns {
        Some(ReturnKind::Float64) => invoke!(code, f64, args).to_string(),
        Some(ReturnKind::Float32) => invoke!(code, f32, args).to_string(),
        Some(ReturnKind::Int) | None => invoke!(code, i64, args).to_string(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplAction {
    Continue,
    Break,
}

#[derive(Default)]
struct ReplSession {
    lines: Vec<String>,
}

impl ReplSession {
    /// Replays the buffer plus `extra` into a fresh assembler.
    fn replay<T: Target>(
        &self,
        target: &T,
        config: &JitConfig,
        extra: Option<&str>,
    ) -> Result<Assembler<T>, Box<dyn std::error::Error>> {
        let mut assembler = Assembler::new(target.clone(), Arena::from_config(config)?)?;
        let lines = self.lines.iter().map(String::as_str).chain(extra);
        for (index, line) in lines.enumerate() {
            assembler.line(index + 1, line)?;
        }
        Ok(assembler)
    }

    fn finish<T: Target>(
        &self,
        target: &T,
        config: &JitConfig,
    ) -> Result<Assembly, Box<dyn std::error::Error>> {
        let assembly = self.replay(target, config, None)?.finish()?;
        Ok(assembly)
    }
}

fn run_repl<T: Target>(target: T, config: &JitConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("lt-jit REPL ({})", logging::target_label(target.name()));
    println!("history: up/down arrows, commands: :help, :quit");
    let mut editor = DefaultEditor::new()?;
    let mut session = ReplSession::default();
    loop {
        let prompt = format!("lt-jit[{}]> ", session.lines.len() + 1);
        match editor.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if line.starts_with(':') {
                    if handle_repl_command(line, &target, config, &mut session)
                        == ReplAction::Break
                    {
                        break;
                    }
                    continue;
                }
                match session.replay(&target, config, Some(line)) {
                    Ok(_) => session.lines.push(line.to_string()),
                    Err(err) => println!("{} {err}", logging::category_error()),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("bye");
                break;
            }
            Err(err) => {
                return Err(Box::new(io::Error::other(err.to_string())));
            }
        }
    }
    Ok(())
}

fn handle_repl_command<T: Target>(
    line: &str,
    target: &T,
    config: &JitConfig,
    session: &mut ReplSession,
) -> ReplAction {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        ":quit" | ":exit" => return ReplAction::Break,
        ":help" => {
            println!("commands:");
            println!("  :run [A,B,...]  assemble the buffer and call it");
            println!("  :dump           assemble the buffer and print its bytes");
            println!("  :list           show the buffer");
            println!("  :reset          clear the buffer");
            println!("  :quit           quit repl");
        }
        ":list" => {
            for (index, line) in session.lines.iter().enumerate() {
                println!("{:>4}  {line}", index + 1);
            }
        }
        ":reset" => {
            session.lines.clear();
            println!("buffer cleared");
        }
        ":dump" => match session.finish(target, config) {
            Ok(assembly) => print_dump(&assembly),
            Err(err) => println!("{} {err}", logging::category_error()),
        },
        ":run" => {
            let outcome = parse_call_args(rest).and_then(|args| {
                let assembly = session.finish(target, config).map_err(|err| err.to_string())?;
                call_function(&assembly, &args)
            });
            match outcome {
                Ok(result) => println!("=> {result}"),
                Err(err) => {
                    warn!("{} {err}", logging::category_run());
                    println!("{} {err}", logging::category_error());
                }
            }
        }
        other => println!("unknown command: {other}"),
    }
    ReplAction::Continue
}
