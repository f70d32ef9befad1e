//! Interface de linha de comando do jobline baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (setup, submit, run,
//! run-all, status, recover) e flags globais (--config, --verbose,
//! --log-level). `run` e `run-all` aceitam `--instance` para escolher a
//! árvore drenada.

use std::path::PathBuf;

use jobline::topology::Instance;

use clap::{Parser, Subcommand, ValueEnum};

/// jobline: pipeline de jobs em arquivos com pool de endpoints compartilhado.
#[derive(Debug, Parser)]
#[command(name = "jobline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, env = "JOBLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (nível debug).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Filtro de log quando `RUST_LOG` não está definido.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

/// Instâncias drenadas por `run`/`run-all`, mapeadas para [`Instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum InstanceArg {
    /// Apenas a árvore prioritária.
    Priority,
    /// Apenas a árvore normal.
    #[value(alias = "main")]
    Normal,
    /// As duas, prioritária primeiro.
    #[default]
    Both,
}

impl InstanceArg {
    /// Instâncias na ordem de varredura.
    pub fn instances(self) -> &'static [Instance] {
        match self {
            InstanceArg::Priority => &[Instance::Priority],
            InstanceArg::Normal => &[Instance::Normal],
            InstanceArg::Both => &Instance::DRAIN_ORDER,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria a árvore de diretórios das duas instâncias.
    Setup,

    /// Cria um registro no primeiro estágio.
    Submit {
        /// Envia para a instância prioritária.
        #[arg(long)]
        priority: bool,

        /// Cabeçalho adicional no formato `Chave=Valor` (repetível).
        #[arg(long = "header", value_name = "KEY=VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Arquivo com o corpo do registro; `-` ou ausente lê da entrada padrão.
        file: Option<PathBuf>,
    },

    /// Drena um estágio.
    Run {
        /// Nome do estágio.
        #[arg(long)]
        stage: String,

        /// Instância a drenar.
        #[arg(long, value_enum, default_value_t = InstanceArg::Both)]
        instance: InstanceArg,

        /// Continua verificando a entrada em vez de sair quando vazia.
        #[arg(long)]
        watch: bool,

        /// Intervalo entre verificações no modo watch, em segundos.
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },

    /// Drena todos os estágios na ordem da topologia.
    RunAll {
        /// Instância a drenar.
        #[arg(long, value_enum, default_value_t = InstanceArg::Both)]
        instance: InstanceArg,

        /// Repete as passagens até receber sinal ou sentinela de parada.
        #[arg(long)]
        watch: bool,

        /// Intervalo entre passagens no modo watch, em segundos.
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },

    /// Mostra contagens por diretório, claims em andamento e leases.
    Status,

    /// Devolve claims em andamento de um estágio à sua entrada.
    Recover {
        /// Nome do estágio.
        #[arg(long)]
        stage: String,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("header key must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["jobline", "run", "--stage", "parsed", "--watch"]);
        match cli.command {
            Command::Run {
                stage,
                instance,
                watch,
                poll_secs,
            } => {
                assert_eq!(stage, "parsed");
                assert_eq!(instance, InstanceArg::Both);
                assert!(watch);
                assert_eq!(poll_secs, 5);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_instance_selector() {
        let cli = Cli::parse_from(["jobline", "run-all", "--instance", "normal"]);
        let Command::RunAll { instance, .. } = cli.command else {
            panic!("expected RunAll command");
        };
        assert_eq!(instance.instances(), &[Instance::Normal]);

        let cli = Cli::parse_from(["jobline", "run", "--stage", "s", "--instance", "main"]);
        let Command::Run { instance, .. } = cli.command else {
            panic!("expected Run command");
        };
        assert_eq!(instance, InstanceArg::Normal);

        assert_eq!(
            InstanceArg::Both.instances(),
            &[Instance::Priority, Instance::Normal]
        );
        assert!(Cli::try_parse_from(["jobline", "run-all", "--instance", "all"]).is_err());
    }

    #[test]
    fn cli_parses_submit_headers() {
        let cli = Cli::parse_from([
            "jobline",
            "submit",
            "--priority",
            "--header",
            "Title=Rust 2024",
            "--header",
            "Source=a=b",
            "item.txt",
        ]);
        match cli.command {
            Command::Submit {
                priority,
                headers,
                file,
            } => {
                assert!(priority);
                assert_eq!(
                    headers,
                    vec![
                        ("Title".to_string(), "Rust 2024".to_string()),
                        ("Source".to_string(), "a=b".to_string()),
                    ]
                );
                assert_eq!(file, Some(PathBuf::from("item.txt")));
            }
            _ => panic!("expected Submit command"),
        }
    }

    #[test]
    fn cli_rejects_malformed_header() {
        assert!(Cli::try_parse_from(["jobline", "submit", "--header", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["jobline", "submit", "--header", "=x"]).is_err());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "jobline",
            "--config",
            "/etc/jobline.toml",
            "--log-level",
            "warn",
            "--verbose",
            "status",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/jobline.toml")));
        assert_eq!(cli.log_level, "warn");
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
