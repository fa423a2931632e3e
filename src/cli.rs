//! Interface de linha de comando do enhance-flow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status)
//! e flags globais (--config, --log-level).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// enhance-flow: orquestrador durável de lotes fetch → transform → store.
#[derive(Debug, Parser)]
#[command(name = "enhance-flow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./enhance-flow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Nível de log quando RUST_LOG não está definido.
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Processa o lote configurado, retomando workflows interrompidos.
    Run(RunArgs),

    /// Mostra o estado recuperado de cada item com journal.
    Status,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Lista de imagens: chaves separadas por vírgula ou array JSON.
    #[arg(long)]
    pub images: Option<String>,

    /// Máximo de workflows simultâneos.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Diretiva aplicada a todas as imagens.
    #[arg(long)]
    pub enhancement_prompt: Option<String>,

    /// Exibe barra de progresso (padrão).
    #[arg(long, overrides_with = "no_progress")]
    pub progress: bool,

    /// Desativa a barra de progresso e mostra logs informativos.
    #[arg(long, overrides_with = "progress")]
    pub no_progress: bool,

    /// Descarta journals anteriores em vez de retomar.
    #[arg(long, default_value_t = false)]
    pub fresh: bool,
}

impl RunArgs {
    /// A última entre --progress e --no-progress vence; sem nenhuma, exibe.
    pub fn show_progress(&self) -> bool {
        !self.no_progress
    }
}
