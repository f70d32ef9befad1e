//! Interface de terminal do jobline: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de drenagem e `console` para
//! estilização com cores. Logs estruturados vão para o `tracing`; aqui fica
//! só o que o operador lê.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use jobline::context::{DirCount, PipelineStatus};
use jobline::state_machine::DrainReport;

/// Indicador visual enquanto um estágio é drenado.
///
/// Exibe um spinner com as contagens correntes e, ao final, uma linha
/// colorida: verde para avanços, vermelho para rejeições, amarelo para
/// adiamentos e registros corrompidos.
pub struct DrainProgress {
    // Spinner do indicatif; oculto quando a saída não é um terminal.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl DrainProgress {
    /// Inicia o spinner para o estágio informado.
    pub fn start(stage: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{stage}: draining"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner com as contagens acumuladas.
    pub fn update(&self, report: &DrainReport) {
        self.pb.set_message(format!(
            "{}: {} advanced, {} rejected",
            report.stage, report.succeeded, report.rejected
        ));
    }

    /// Finaliza o spinner e imprime o resumo do estágio.
    pub fn finish(&self, report: &DrainReport) {
        self.pb.finish_and_clear();
        println!("{}", self.summary_line(report));
    }

    /// Remove o spinner sem imprimir nada.
    pub fn clear(&self) {
        self.pb.finish_and_clear();
    }

    fn summary_line(&self, report: &DrainReport) -> String {
        let mut line = format!(
            "  {} {:<16} {} advanced, {} rejected",
            self.green.apply_to("✓"),
            report.stage,
            self.green.apply_to(report.succeeded),
            self.red.apply_to(report.rejected),
        );
        if report.deferred > 0 {
            line.push_str(&format!(
                ", {} deferred",
                self.yellow.apply_to(report.deferred)
            ));
        }
        if !report.corrupt.is_empty() {
            line.push_str(&format!(
                ", {} corrupt",
                self.yellow.apply_to(report.corrupt.len())
            ));
        }
        if report.stopped {
            line.push_str(&format!(" ({})", self.yellow.apply_to("stop sentinel")));
        }
        line
    }
}

/// Imprime a visão geral: contagens por diretório em cada instância,
/// claims em andamento e leases ativos.
pub fn print_status(status: &PipelineStatus) {
    let header = Style::new().bold();
    let dim = Style::new().dim();
    let yellow = Style::new().yellow();
    let red = Style::new().red();

    if status.stop_requested {
        println!("{}", yellow.apply_to("stop sentinel present: workers will not claim"));
    }

    for instance in &status.instances {
        println!();
        println!("{}", header.apply_to(format!("─── {} ───", instance.instance)));
        for dir in &instance.flow {
            println!("  {}", format_count(dir, &dim, &yellow));
        }
        for dir in instance.rejects.iter().filter(|d| d.waiting > 0) {
            println!("  {}", red.apply_to(format_count(dir, &dim, &yellow)));
        }
    }

    println!();
    println!("{}", header.apply_to("─── leases ───"));
    if status.leases.is_empty() {
        println!("  {}", dim.apply_to("none"));
    }
    for lease in &status.leases {
        let name = lease
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match &lease.descriptor {
            Some(d) => {
                let state = if lease.holder_alive {
                    "held"
                } else {
                    "abandoned"
                };
                println!(
                    "  {}#{} pid {} {} since {} ({})",
                    d.endpoint,
                    d.slot,
                    d.pid,
                    state,
                    d.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                    d.purpose
                );
            }
            None => println!("  {} {}", name, yellow.apply_to("unreadable descriptor")),
        }
    }
}

fn format_count(dir: &DirCount, dim: &Style, yellow: &Style) -> String {
    let mut line = format!("{:<28} {:>6}", dir.name, dir.waiting);
    if dir.in_progress > 0 {
        line.push_str(&format!(
            "  {}",
            yellow.apply_to(format!("{} in progress", dir.in_progress))
        ));
    } else if dir.waiting == 0 {
        line = dim.apply_to(line).to_string();
    }
    line
}
