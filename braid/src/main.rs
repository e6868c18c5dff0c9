//! The standalone braid binary: analyze a tree of braid files and write a
//! Ninja manifest.

use braid::{builtins, Context, SimpleConfig};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

const USAGE: &str = "\
usage: braid [options] <module-list-file>

options:
  -o <path>               output manifest path (default build.ninja)
  -d <path>               write the manifest's file-dependency list
  --root <dir>            source root directory (default: list file's dir)
  --empty                 emit a headers-only manifest and exit
  --module-debug <path>   write per-variant debug JSON
  --incremental-analysis  restore unchanged variants from the cache
  --incremental-cache     store analysis artifacts into the cache
  --shard                 split module blocks across shard files
  --cpuprofile <path>     accepted and ignored
  --memprofile <path>     accepted and ignored
  --traceprofile <path>   accepted and ignored
";

struct Options {
    list_file: Option<String>,
    output: String,
    deps_output: Option<String>,
    root: Option<String>,
    empty: bool,
    module_debug: Option<String>,
    incremental_analysis: bool,
    incremental_cache: bool,
    shard: bool,
}

fn main() {
    std::process::exit(main_inner());
}

fn main_inner() -> i32 {
    env_logger::init();
    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{}", msg);
            eprint!("{}", USAGE);
            return 2;
        }
    };
    let list_file = match &opts.list_file {
        Some(f) => f.clone(),
        None => {
            eprint!("{}", USAGE);
            return 2;
        }
    };

    let root = opts.root.clone().unwrap_or_else(|| {
        Path::new(&list_file)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string())
    });
    let out_dir = Path::new(&opts.output)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());

    let config = Arc::new(SimpleConfig::new(out_dir));
    let mut ctx = Context::new(config, &root);
    builtins::register(&mut ctx);
    ctx.set_incremental_analysis(opts.incremental_analysis);
    ctx.set_incremental_cache(opts.incremental_cache);

    // The list file path is root-relative inside the context.
    let list_rel = match Path::new(&list_file).strip_prefix(&root) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => list_file.clone(),
    };

    if opts.empty {
        return finish(write_output(&ctx, &opts, true));
    }

    if let Err(errs) = ctx.parse_file_list(&list_rel) {
        return report(errs);
    }
    if let Err(errs) = ctx.resolve_dependencies() {
        return report(errs);
    }
    if let Err(errs) = ctx.prepare_build_actions() {
        return report(errs);
    }

    if let Some(path) = &opts.module_debug {
        if let Err(e) = File::create(path).and_then(|f| ctx.write_module_debug(f)) {
            eprintln!("{} {}", red("error:"), e);
            return 1;
        }
    }
    if let Some(path) = &opts.deps_output {
        let deps = ctx.manifest_deps().join("\n");
        if let Err(e) = File::create(path).and_then(|mut f| writeln!(f, "{}", deps)) {
            eprintln!("{} {}", red("error:"), e);
            return 1;
        }
    }

    finish(write_output(&ctx, &opts, false))
}

fn write_output(ctx: &Context, opts: &Options, empty: bool) -> std::io::Result<()> {
    if opts.shard && !empty {
        let dir = Path::new(&opts.output)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        return ctx.write_build_file_sharded(dir);
    }
    let file = File::create(&opts.output)?;
    if empty {
        ctx.write_empty_build_file(file)
    } else {
        ctx.write_build_file(file)
    }
}

fn finish(result: std::io::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {}", red("error:"), e);
            1
        }
    }
}

fn report(errs: Vec<braid::Error>) -> i32 {
    for err in errs {
        eprintln!("{} {}", red("error:"), err);
    }
    1
}

fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}

fn parse_args() -> Result<Options, String> {
    let mut opts = Options {
        list_file: None,
        output: "build.ninja".to_string(),
        deps_output: None,
        root: None,
        empty: false,
        module_debug: None,
        incremental_analysis: false,
        incremental_cache: false,
        shard: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next().ok_or_else(|| format!("{} requires a value", name))
        };
        match arg.as_str() {
            "-o" => opts.output = value("-o")?,
            "-d" => opts.deps_output = Some(value("-d")?),
            "--root" => opts.root = Some(value("--root")?),
            "--empty" => opts.empty = true,
            "--module-debug" => opts.module_debug = Some(value("--module-debug")?),
            "--incremental-analysis" => opts.incremental_analysis = true,
            "--incremental-cache" => opts.incremental_cache = true,
            "--shard" => opts.shard = true,
            "--cpuprofile" | "--memprofile" | "--traceprofile" => {
                value(&arg)?;
            }
            "-h" | "--help" => return Err(String::new()),
            other if other.starts_with('-') => {
                return Err(format!("unknown flag {:?}", other));
            }
            _ => {
                if opts.list_file.is_some() {
                    return Err("more than one module-list file given".to_string());
                }
                opts.list_file = Some(arg);
            }
        }
    }
    Ok(opts)
}
