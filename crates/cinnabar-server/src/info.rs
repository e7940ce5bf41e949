//! `INFO` section rendering.

use rand::Rng;

use crate::config::ServerConfig;

/// Static identity reported by `INFO`, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub tcp_port: u16,
    pub replica_of: Option<(String, u16)>,
    /// 40 hex characters identifying this node's replication stream.
    pub master_replid: String,
}

/// Generates a fresh 40-hex replication ID.
pub fn generate_replid() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).expect("digit in range"))
        .collect()
}

impl ServerInfo {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            tcp_port: config.port,
            replica_of: config.replica_of.clone(),
            master_replid: generate_replid(),
        }
    }

    /// Renders the requested sections, each as `#<Name>` followed by
    /// `key:value` lines. `default` expands to every known section, as
    /// does an empty request; unknown names render nothing.
    pub fn render(&self, sections: &[String], master_repl_offset: u64) -> String {
        let mut requested: Vec<&str> = Vec::new();
        let mut push_default = |requested: &mut Vec<&str>| {
            requested.push("server");
            requested.push("replication");
        };

        for section in sections {
            if section == "default" {
                push_default(&mut requested);
            } else {
                requested.push(section);
            }
        }
        if requested.is_empty() {
            push_default(&mut requested);
        }

        let mut out = String::new();
        for section in requested {
            match section {
                "server" => {
                    out.push_str("#Server\n");
                    out.push_str(&format!("tcp_port:{}\n", self.tcp_port));
                }
                "replication" => {
                    out.push_str("#Replication\n");
                    match &self.replica_of {
                        None => out.push_str("role:master\n"),
                        Some((host, port)) => {
                            out.push_str("role:slave\n");
                            out.push_str(&format!("master_host:{host}\n"));
                            out.push_str(&format!("master_port:{port}\n"));
                        }
                    }
                    out.push_str(&format!("master_replid:{}\n", self.master_replid));
                    out.push_str(&format!("master_repl_offset:{master_repl_offset}\n"));
                }
                _ => {}
            }
        }
        out
    }
}
