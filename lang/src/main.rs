use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::exit,
};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};

use stackc::{
    bytecode::{Archive, Executable, Object, Value},
    linker, loader,
    vm::{EvalError, InnerEvalError, Memory, StepResult, Vm},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bundle compiled objects into a library archive.
    Archive {
        objects: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Link objects and libraries into an executable.
    Link {
        objects: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        /// Directories searched for `lib<name>.a`.
        #[arg(short = 'L')]
        search: Vec<PathBuf>,
        /// Libraries, searched in the order given.
        #[arg(short = 'l')]
        libraries: Vec<String>,
        #[arg(long, default_value = "main")]
        entry: String,
    },
    /// Run an executable; the process exits with the program's exit value.
    Run {
        executable: PathBuf,
        /// Print every executed instruction to stderr.
        #[arg(long)]
        trace: bool,
        #[arg(long)]
        max_steps: Option<u64>,
        #[arg(long)]
        stack_limit: Option<i64>,
    },
    /// Print an address-annotated listing of an executable.
    Disasm { executable: PathBuf },
}

fn read_object(path: &Path) -> anyhow::Result<Object> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    postcard::from_bytes(&bytes).with_context(|| format!("decoding object {}", path.display()))
}

fn read_executable(path: &Path) -> anyhow::Result<Executable> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Executable::from_bytes(&bytes).with_context(|| format!("decoding executable {}", path.display()))
}

fn find_library(search: &[PathBuf], name: &str) -> anyhow::Result<Archive> {
    let file = format!("lib{}.a", name);
    let path = search
        .iter()
        .map(|dir| dir.join(&file))
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow!("library {} not found in -L directories", name))?;
    Ok(linker::read_archive(&path)?)
}

fn archive(objects: Vec<PathBuf>, output: PathBuf) -> anyhow::Result<()> {
    let objects: Vec<Object> = objects.iter().map(|p| read_object(p)).collect::<anyhow::Result<_>>()?;
    let archive = linker::library(objects);
    std::fs::write(&output, archive.to_bytes()?)
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(())
}

fn link(
    objects: Vec<PathBuf>,
    output: PathBuf,
    search: Vec<PathBuf>,
    libraries: Vec<String>,
    entry: String,
) -> anyhow::Result<()> {
    if objects.is_empty() {
        bail!("no input objects");
    }
    let objects: Vec<Object> = objects.iter().map(|p| read_object(p)).collect::<anyhow::Result<_>>()?;
    let archives: Vec<Archive> = libraries
        .iter()
        .map(|name| find_library(&search, name))
        .collect::<anyhow::Result<_>>()?;
    let exe = linker::executable(&objects, &archives, &entry)?;
    std::fs::write(&output, exe.to_bytes()?)
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(())
}

fn run(
    path: PathBuf,
    trace: bool,
    max_steps: Option<u64>,
    stack_limit: Option<i64>,
) -> anyhow::Result<()> {
    let exe = read_executable(&path)?;
    let mut vm = Vm::new(&exe)?;
    if let Some(cells) = stack_limit {
        vm = vm.with_stack_limit(cells);
    }

    let result = match (trace, max_steps) {
        (true, _) => run_traced(&mut vm, max_steps.unwrap_or(u64::MAX)),
        (false, Some(max)) => vm.run_with_limit(max),
        (false, None) => vm.run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}\n", e.into_user(&vm.image));
        eprintln!("Stack:");
        for address in ((vm.cpu.sp + 1)..=-1).take(16) {
            eprintln!("  {:>6}: {}", address, vm.memory.read(address));
        }
        exit(1);
    }

    match vm.exit_value() {
        Value::Int(status) => exit(status as i32),
        Value::Float(f) => {
            eprintln!("exit value: {:?}", f);
            exit(0)
        }
    }
}

fn run_traced(vm: &mut Vm, max_steps: u64) -> Result<(), EvalError> {
    for _ in 0..max_steps {
        match vm.current() {
            Ok(decoded) => eprintln!(
                "{:>6}  {:<24} sp={:<6} bp={:<6} {}",
                vm.cpu.ip,
                decoded.to_string(),
                vm.cpu.sp,
                vm.cpu.bp,
                vm.current_location().map(|l| l.to_string()).unwrap_or_default(),
            ),
            Err(_) => eprintln!("{:>6}  ???", vm.cpu.ip),
        }
        if let StepResult::Exit = vm.step()? {
            return Ok(());
        }
    }
    vm.kernel.release();
    Err(EvalError {
        address: vm.cpu.ip,
        inner: InnerEvalError::StepBudgetExhausted { steps: max_steps },
    })
}

fn disasm(path: PathBuf) -> anyhow::Result<()> {
    let exe = read_executable(&path)?;
    let image = loader::load(&exe, &mut Memory::default())?;

    let labels: BTreeMap<_, _> = exe
        .symbols
        .iter()
        .filter_map(|s| s.body.first().map(|w| (*w, s.name.as_str())))
        .collect();
    for (idx, word) in exe.words.iter_enumerated() {
        if let Some(name) = labels.get(&idx) {
            println!("{}:", name);
        }
        println!(
            "{:>6}  {:<32} ; {}",
            image.addresses[idx],
            word.to_string(),
            word.location
        );
    }
    println!("{:>6}  halt", image.end - 1);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Archive { objects, output } => archive(objects, output),
        Commands::Link {
            objects,
            output,
            search,
            libraries,
            entry,
        } => link(objects, output, search, libraries, entry),
        Commands::Run {
            executable,
            trace,
            max_steps,
            stack_limit,
        } => run(executable, trace, max_steps, stack_limit),
        Commands::Disasm { executable } => disasm(executable),
    }
}
