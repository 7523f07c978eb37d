use anyhow::{anyhow, bail, Result};
use archsim::demo::{build_pipeline, register_factories, Pipeline};
use archsim::prelude::*;
use archsim::tree::RenderOptions;
use archsim::{ENGINE_NAME, VERSION as LIB_VERSION};
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use tracing::info;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CORES: u32 = 2;
const SHELL_ORIGIN: &str = "archshell";

/// Highlights the command word of the line being edited.
#[derive(Completer, Helper, Hinter, Validator)]
struct CommandHighlighter;

impl Highlighter for CommandHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", format!("{ENGINE_NAME} shell").cyan().bold());
    println!("  Shell   v{SHELL_VERSION:<8} Library   v{LIB_VERSION:<8}");
    println!("{}", "-".repeat(60).dimmed());
}

/// The model under exploration and the pieces of it the shell drives.
struct Session {
    sim: Simulation,
    pipeline: Pipeline,
    triggers: Vec<Trigger>,
}

impl Session {
    fn new(cores: u32) -> Result<Self> {
        let mut sim = Simulation::new("top")?;
        register_factories(&mut sim)?;
        let pipeline = build_pipeline(&mut sim, cores)?;
        Ok(Self { sim, pipeline, triggers: Vec::new() })
    }

    /// Resolves `path` from the model root, falling back to absolute lookup.
    fn resolve(&self, path: Option<&str>) -> Result<NodeId> {
        let top = self.sim.top();
        match path {
            None | Some(".") => Ok(top),
            Some(path) => {
                let tree = self.sim.tree();
                Ok(tree.get_child(top, path).or_else(|_| tree.lookup(path))?)
            }
        }
    }

    fn dispatch(&mut self, args: &[&str]) -> Result<()> {
        let Some((&command, rest)) = args.split_first() else {
            return Ok(());
        };
        match command {
            "tree" => self.tree(rest),
            "find" => self.find(rest),
            "tags" => self.tags(rest),
            "param" => self.param(rest),
            "set" => self.set(rest),
            "configure" => {
                self.sim.enter_configuring()?;
                println!("--> tree is {}", self.sim.phase());
                Ok(())
            }
            "finalize" => self.finalize(),
            "run" => self.run(rest),
            "stats" => self.stats(),
            "dag" => {
                if !self.sim.scheduler().is_finalized() {
                    bail!("the scheduler is not finalized yet; use 'finalize'");
                }
                print!("{}", self.sim.scheduler().dag_dot());
                Ok(())
            }
            "phase" => {
                println!(
                    "--> tree {}, tick {}",
                    self.sim.phase(),
                    self.sim.scheduler().current_tick()
                );
                Ok(())
            }
            "help" => {
                print_help();
                Ok(())
            }
            _ => bail!("unknown command '{command}'. Type 'help'."),
        }
    }

    fn tree(&self, args: &[&str]) -> Result<()> {
        let all = args.contains(&"--all");
        let mut positional = args.iter().copied().filter(|a| !a.starts_with("--"));
        let from = self.resolve(positional.next())?;
        let depth = positional.next().map(str::parse::<usize>).transpose()?;
        let opts = RenderOptions {
            show_builtin_groups: all,
            show_hidden: all,
            ..RenderOptions::default()
        };
        print!("{}", self.sim.tree().render_subtree(from, depth, &opts));
        Ok(())
    }

    fn find(&self, args: &[&str]) -> Result<()> {
        let pattern = args.first().ok_or_else(|| anyhow!("usage: find <PATTERN>"))?;
        let tree = self.sim.tree();
        let found = tree.find_children(self.sim.top(), pattern, None)?;
        for id in &found {
            println!("  {}", tree.location(*id).cyan());
        }
        println!("--> {} match(es)", found.len());
        Ok(())
    }

    fn tags(&self, args: &[&str]) -> Result<()> {
        let tag = args.first().ok_or_else(|| anyhow!("usage: tags <TAG>"))?;
        let tree = self.sim.tree();
        let found = tree.find_children_by_tag(self.sim.top(), tag, None);
        for id in &found {
            println!("  {}", tree.location(*id).cyan());
        }
        println!("--> {} node(s) tagged '{}'", found.len(), tag);
        Ok(())
    }

    fn param(&self, args: &[&str]) -> Result<()> {
        let path = args.first().ok_or_else(|| anyhow!("usage: param <PATH>"))?;
        let id = self.resolve(Some(path))?;
        let tree = self.sim.tree();
        let param = tree.parameter(id)?;
        println!(
            "  {} : {} = {} (default {}, from {})",
            tree.location(id).cyan(),
            param.param_type().name(),
            param.value_as_string().green(),
            param.default_as_string(),
            param.origin()
        );
        if !param.doc().is_empty() {
            println!("    {}", param.doc().dimmed());
        }
        Ok(())
    }

    fn set(&mut self, args: &[&str]) -> Result<()> {
        let [pattern, value, ..] = args else {
            bail!("usage: set <PATTERN> <VALUE>");
        };
        if self.sim.phase() > TreePhase::Configuring {
            bail!("parameters are frozen once the tree is {}", self.sim.phase());
        }
        let created = self.sim.vpt_mut().set(pattern, value, true, SHELL_ORIGIN);
        println!(
            "--> {} {} = {}",
            if created { "added" } else { "replaced" },
            pattern.cyan(),
            value
        );
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.sim.phase() == TreePhase::Building {
            self.sim.enter_configuring()?;
        }
        self.sim.enter_finalized()?;
        self.sim.finalize_scheduler()?;
        self.triggers = self.pipeline.arm(&mut self.sim)?;
        println!(
            "--> finalized: {} nodes, {} events, {} trigger(s) armed",
            self.sim.tree().len(),
            self.sim.scheduler().event_count(),
            self.triggers.len()
        );
        Ok(())
    }

    fn run(&mut self, args: &[&str]) -> Result<()> {
        if !self.sim.scheduler().is_finalized() {
            bail!("the model is not finalized yet; use 'finalize'");
        }
        let exacting = args.contains(&"exact");
        let ticks = match args.iter().find(|a| **a != "exact") {
            Some(text) => text.parse::<u64>()?,
            None => self.sim.config().run.ticks,
        };
        let summary = self.sim.run_with(ticks, exacting)?;
        println!("{} {}", "run:".green().bold(), summary);
        Ok(())
    }

    fn stats(&self) -> Result<()> {
        let stats = self.sim.statistics(self.sim.top());
        if stats.is_empty() {
            println!("--> no statistics yet");
        }
        for (location, value) in stats {
            println!("  {:<40} {}", location.cyan(), value);
        }
        Ok(())
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  tree [PATH] [DEPTH] [--all]  - Renders the model tree.");
    println!("  find <PATTERN>               - Lists nodes matching a wildcard path.");
    println!("  tags <TAG>                   - Lists nodes carrying a tag.");
    println!("  param <PATH>                 - Shows one parameter.");
    println!("  set <PATTERN> <VALUE>        - Adds a parameter override.");
    println!("  configure                    - Enters the configuring phase.");
    println!("  finalize                     - Builds resources and arms the pipeline.");
    println!("  run [TICKS] [exact]          - Advances the simulation.");
    println!("  stats                        - Prints counters and statistics.");
    println!("  dag                          - Dumps the scheduling DAG as dot.");
    println!("  phase                        - Shows the tree phase and tick.");
    println!("  exit                         - Quits the shell.");
}

fn spawn_event_listener(sim: &Simulation) {
    let mut system_rx = sim.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            println!("\n<-- [SYSTEM EVENT] {:?}", event);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let cores = match env::args().nth(1) {
        Some(text) => text.parse::<u32>()?,
        None => DEFAULT_CORES,
    };
    let mut session = Session::new(cores)?;
    spawn_event_listener(&session.sim);
    info!("Built a {}-core pipeline in {}", cores, ENGINE_NAME.cyan());

    let mut rl = Editor::new()?;
    rl.set_helper(Some(CommandHighlighter));

    println!("{} shell is ready. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();
                if args.first() == Some(&"exit") {
                    break;
                }
                if let Err(err) = session.dispatch(&args) {
                    println!("{} {:#}", "error:".red().bold(), err);
                }
            }
            Err(_) => break,
        }
    }

    println!("Exiting archshell...");
    if session.sim.phase() != TreePhase::Teardown {
        session.sim.enter_teardown()?;
    }
    Ok(())
}
