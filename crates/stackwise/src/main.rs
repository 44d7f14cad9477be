use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use stackwise_core::format::{ObjectFormat, HEADER_PREFIX_LEN};
use stackwise_core::registry::{default_source, LoadedModule, ModuleDescriptor, ModuleRegistry, ModuleSource, ProcMaps};
use stackwise_core::symbols::{BuildMode, FsImageReader, ImageReader, ModuleIndex, SymbolResolver};
use stackwise_core::{
    Address, CaptureRequest, CaptureResult, FormatOptions, StackTraceFrame, StackTracer, Style, TraceError,
    TraceFormatter, TraceResult,
};
use stackwise_utils::{debug, init_logging, TraceSettings};

/// Capture and symbolicate stack traces.
#[derive(Parser, Debug)]
#[command(name = "stackwise")]
#[command(version)]
#[command(about = "Capture and symbolicate stack traces", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Capture and print this process's own stack
    Trace
    {
        #[command(flatten)]
        output: OutputArgs,
        /// Innermost frames to drop
        #[arg(long)]
        skip_frames: Option<usize>,
    },
    /// Symbolicate addresses within an object file
    Resolve
    {
        /// Object file to read symbols and line tables from
        #[arg(short, long)]
        module: PathBuf,
        /// Address the module is loaded at (hex `0x...` or decimal). Defaults
        /// to the image's link-time base, so addresses taken from the file
        /// itself (`nm`, `objdump`) resolve as-is
        #[arg(short, long, value_parser = parse_address)]
        base: Option<Address>,
        /// Addresses to resolve (hex `0x...` or decimal)
        #[arg(required = true, value_parser = parse_address)]
        addresses: Vec<Address>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List loaded modules
    Modules
    {
        /// Process to inspect (Linux only; defaults to this process)
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Detect the object format of files
    Detect
    {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Flags shared by the commands that print frames
#[derive(Args, Debug)]
struct OutputArgs
{
    /// Print bracketed attribute lists instead of one line per frame
    #[arg(long)]
    structured: bool,
    /// Print raw symbol names
    #[arg(long)]
    no_demangle: bool,
    /// Skip source file and line lookup
    #[arg(long)]
    no_lines: bool,
    /// Maximum number of frames
    #[arg(long)]
    max_frames: Option<usize>,
}

impl OutputArgs
{
    /// Environment settings with flags layered on top.
    fn request(&self, settings: &TraceSettings) -> CaptureRequest
    {
        let mut request = CaptureRequest::new()
            .with_max_frames(self.max_frames.unwrap_or(settings.max_frames))
            .with_skip_frames(settings.skip_frames)
            .with_demangle(settings.demangle && !self.no_demangle)
            .with_lines(!self.no_lines);
        if let Some(budget) = settings.resolve_budget {
            request = request.with_resolve_budget(budget);
        }
        request
    }

    fn formatter(&self, request: &CaptureRequest) -> TraceFormatter
    {
        let mut options = FormatOptions::default()
            .with_demangle(request.demangle)
            .with_location(request.resolve_lines);
        if self.structured {
            options = options.with_style(Style::Structured {
                level: 0,
                spaces_per_level: Some(1),
            });
        }
        TraceFormatter::new(options)
    }
}

fn parse_address(s: &str) -> Result<Address, String>
{
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map(Address::from).map_err(|err| format!("invalid address '{s}': {err}"))
}

fn main()
{
    // Logs go to stderr; stdout carries the traces
    let _guard = match init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let cli = Cli::parse();

    let settings = match TraceSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    };

    if let Err(e) = run_command(cli, &settings) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(cli: Cli, settings: &TraceSettings) -> TraceResult<()>
{
    match cli.command {
        Commands::Trace { output, skip_frames } => {
            let mut request = output.request(settings);
            if let Some(skip) = skip_frames {
                request = request.with_skip_frames(skip);
            }

            let tracer = StackTracer::for_current_process()?;
            debug!(modules = tracer.registry().len(), "module registry loaded");
            let trace = tracer.capture(&request);
            println!("{}", output.formatter(&request).render(&trace));
            Ok(())
        }
        Commands::Resolve {
            module,
            base,
            addresses,
            output,
        } => {
            let request = output.request(settings);
            let trace = resolve_addresses(&module, base, &addresses, &request)?;
            println!("{}", output.formatter(&request).render(&trace));
            Ok(())
        }
        Commands::Modules { pid } => {
            let source: Box<dyn ModuleSource> = match pid {
                Some(pid) => Box::new(ProcMaps::for_pid(pid)),
                None => default_source(),
            };
            print_modules(&ModuleRegistry::from_source(source.as_ref())?);
            Ok(())
        }
        Commands::Detect { files } => {
            for file in &files {
                println!("{}\t{}", detect_file(file)?, file.display());
            }
            Ok(())
        }
    }
}

/// Resolve user-supplied addresses against a single module.
fn resolve_addresses(
    path: &Path,
    base: Option<Address>,
    addresses: &[Address],
    request: &CaptureRequest,
) -> TraceResult<CaptureResult>
{
    // Surface an unreadable file here rather than as unresolved frames
    FsImageReader.len(path)?;

    let resolver = Arc::new(SymbolResolver::new());
    let image = LoadedModule::new(ModuleDescriptor::new(path.to_path_buf(), Address::ZERO, u64::MAX));
    let index = resolver.index(&image, BuildMode::Blocking).ready().cloned();
    resolve_in(place_module(path, base, index), resolver, addresses, request)
}

/// `path` loaded at `base`, or at its link-time base when no base is given.
fn place_module(path: &Path, base: Option<Address>, index: Option<Arc<ModuleIndex>>) -> LoadedModule
{
    let base = base.unwrap_or_else(|| Address::from(index.as_ref().map_or(0, |index| index.image_base())));
    debug!(%base, "placing module");
    let descriptor = ModuleDescriptor::new(path.to_path_buf(), base, u64::MAX - base.value());
    match index {
        Some(index) => LoadedModule::with_shared_index(descriptor, index),
        None => LoadedModule::new(descriptor),
    }
}

fn resolve_in(
    module: LoadedModule,
    resolver: Arc<SymbolResolver>,
    addresses: &[Address],
    request: &CaptureRequest,
) -> TraceResult<CaptureResult>
{
    let base = module.base();
    if let Some(address) = addresses.iter().find(|address| address.offset_from(base).is_none()) {
        return Err(TraceError::InvalidArgument(format!("address {address} is below module base {base}")));
    }

    let registry = ModuleRegistry::from_modules(vec![Arc::new(module)]);
    let tracer = StackTracer::new(Arc::new(registry), resolver);
    let mut frames: Vec<StackTraceFrame> = addresses
        .iter()
        .take(request.max_frames)
        .enumerate()
        .map(|(i, &address)| StackTraceFrame::new(i, address).with_return_address(false))
        .collect();

    let kept = tracer.resolve_frames(&mut frames, request);
    let incomplete = kept < frames.len() || addresses.len() > request.max_frames;
    frames.truncate(kept);
    Ok(CaptureResult::new(frames, incomplete))
}

fn detect_file(path: &Path) -> TraceResult<ObjectFormat>
{
    let mut prefix = [0u8; HEADER_PREFIX_LEN];
    let read = FsImageReader.read_prefix(path, &mut prefix)?;
    Ok(ObjectFormat::detect(&prefix[..read]))
}

fn print_modules(registry: &ModuleRegistry)
{
    let resolver = SymbolResolver::new();
    for module in registry.modules() {
        println!(
            "{} {} {:<9} {}",
            module.base(),
            module.end(),
            resolver.detect_format(module).name(),
            module.path().display()
        );
    }
}
