//! Interface de terminal do enhance-flow: barra de progresso e resumo colorido.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`BatchProgress`] acompanha visualmente
//! a execução de um lote no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::aggregate::{BatchResult, ItemResult};
use crate::dispatcher::ProgressReporter;
use crate::state_machine::WorkflowState;

/// Barra de progresso do lote: um passo por item terminado.
pub struct BatchProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
    // Estilo verde para itens concluídos.
    green: Style,
    // Estilo vermelho para itens com falha.
    red: Style,
}

impl BatchProgress {
    /// Cria a barra (ainda sem total; definido em `batch_started`).
    pub fn new() -> Self {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }
}

impl Default for BatchProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for BatchProgress {
    fn batch_started(&self, total: usize) {
        self.pb.set_length(total as u64);
        self.pb.set_message("processing images");
    }

    fn item_finished(&self, result: &ItemResult) {
        let mark = if result.is_success() {
            self.green.apply_to("✓")
        } else {
            self.red.apply_to("✗")
        };
        self.pb.set_message(format!("{mark} {}", result.source.file_name()));
        self.pb.inc(1);
    }

    fn batch_finished(&self, _batch: &BatchResult) {
        self.pb.finish_and_clear();
    }
}

/// Imprime o resumo do lote: contagens, tempos e o detalhe de cada falha.
pub fn print_summary(batch: &BatchResult) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let dim = Style::new().dim();

    let header_style = if batch.is_success() { &green } else { &red };
    println!();
    println!("{}", header_style.apply_to("─── Batch Summary ───"));
    println!("  Total images:     {}", batch.total);
    println!("  Successful:       {}", green.apply_to(batch.succeeded));
    println!("  Failed:           {}", red.apply_to(batch.failed));
    println!("  Total time:       {:.2}s", batch.wall_time.as_secs_f64());
    println!(
        "  Average per item: {:.2}s",
        batch.average_item_time.as_secs_f64()
    );

    for result in batch.items.iter().filter(|r| r.is_success()) {
        println!(
            "  {} {} → {}",
            green.apply_to("✓"),
            result.source,
            result.destination
        );
        if let Some(err) = &result.cleanup_error {
            println!("      {}", dim.apply_to(format!("cleanup: {err}")));
        }
    }

    for result in batch.failures() {
        let detail = result
            .failure
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown failure".to_string());
        println!(
            "  {} {} ({})",
            red.apply_to("✗"),
            result.source,
            dim.apply_to(result.item_id)
        );
        println!("      {detail}");
        if let Some(err) = &result.cleanup_error {
            println!("      {}", dim.apply_to(format!("cleanup: {err}")));
        }
    }
}

/// Imprime o estado recuperado de cada workflow com journal.
pub fn print_status(states: &[WorkflowState]) {
    if states.is_empty() {
        println!("No journaled items.");
        return;
    }

    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();

    for wf in states {
        let state = match &wf.result {
            Some(result) if result.is_success() => green.apply_to(wf.state.to_string()),
            Some(_) => red.apply_to(wf.state.to_string()),
            None => yellow.apply_to(format!("{} (attempt {})", wf.state, wf.attempt)),
        };
        println!("  {}  {} → {}  {state}", wf.item.id, wf.item.source, wf.item.destination);
        if let Some(failure) = wf.failure() {
            println!("      {failure}");
        }
    }
}
