// LOADSWEEP EXPERIMENT RUNNER
// SEQUENCES EXPERIMENTS ONE AT A TIME. THE DUT AND GENERATOR ARE EXCLUSIVELY
// OWNED HARDWARE: NOTHING HERE EVER RUNS TWO POINTS CONCURRENTLY.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::error::Result;
use crate::generator::Generator;

pub type TaskId = usize;

pub trait Reporter {
    fn begin_task(&mut self, name: &str, total: u64) -> TaskId;

    fn set_message(&mut self, task: TaskId, msg: &str);

    fn advance(&mut self, task: TaskId, steps: u64);

    fn finish(&mut self, task: TaskId);
}

pub trait Experiment {
    fn name(&self) -> &str;

    fn iterations(&self) -> u32;

    // RE-READ DURABLE STATE RIGHT BEFORE RUNNING (LOGS MAY BE SHARED)
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn run_pass(
        &mut self,
        gen: &mut dyn Generator,
        reporter: &mut dyn Reporter,
        iteration: u32,
    ) -> Result<()>;

    fn run_many(&mut self, gen: &mut dyn Generator, reporter: &mut dyn Reporter) -> Result<()> {
        self.prepare()?;
        let task = reporter.begin_task(self.name(), self.iterations() as u64);
        for iteration in 0..self.iterations() {
            self.run_pass(gen, reporter, iteration)?;
            reporter.advance(task, 1);
        }
        reporter.set_message(task, "done!");
        reporter.finish(task);
        Ok(())
    }
}

// OR SEMANTICS: ANY FILTER SUBSTRING SELECTS THE EXPERIMENT
pub fn matches_filter(name: &str, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|f| name.contains(f.as_str()))
}

pub struct ExperimentRunner {
    experiments: Vec<Box<dyn Experiment>>,
}

impl ExperimentRunner {
    pub fn new() -> Self {
        Self { experiments: Vec::new() }
    }

    pub fn add(&mut self, experiment: Box<dyn Experiment>) {
        self.experiments.push(experiment);
    }

    pub fn add_filtered(&mut self, experiments: Vec<Box<dyn Experiment>>, filters: &[String]) {
        for exp in experiments {
            if matches_filter(exp.name(), filters) {
                self.add(exp);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.experiments.iter().map(|e| e.name()).collect()
    }

    pub fn run(&mut self, gen: &mut dyn Generator, reporter: &mut dyn Reporter) -> Result<()> {
        let total = self.experiments.len();
        let overall = reporter.begin_task("experiments", total as u64);
        for (i, exp) in self.experiments.iter_mut().enumerate() {
            reporter.set_message(overall, &format!("({} out of {} experiments)", i, total));
            exp.run_many(gen, reporter)?;
            reporter.advance(overall, 1);
        }
        reporter.set_message(overall, "All done!");
        reporter.finish(overall);
        Ok(())
    }
}

impl Default for ExperimentRunner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// CONSOLE REPORTER
// ---------------------------------------------------------------------------

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ETA {eta} {prefix:.bold} {msg}";

pub struct ConsoleReporter {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self { multi: MultiProgress::new(), bars: Vec::new() }
    }

    // PRINT A LINE ABOVE THE BARS WITHOUT TEARING THEM
    pub fn println(&self, line: &str) {
        let _ = self.multi.println(line);
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn begin_task(&mut self, name: &str, total: u64) -> TaskId {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(style);
        bar.set_prefix(name.to_string());
        self.bars.push(bar);
        self.bars.len() - 1
    }

    fn set_message(&mut self, task: TaskId, msg: &str) {
        if let Some(bar) = self.bars.get(task) {
            bar.set_message(msg.to_string());
        }
    }

    fn advance(&mut self, task: TaskId, steps: u64) {
        if let Some(bar) = self.bars.get(task) {
            bar.inc(steps);
        }
    }

    fn finish(&mut self, task: TaskId) {
        if let Some(bar) = self.bars.get(task) {
            bar.finish();
        }
    }
}
