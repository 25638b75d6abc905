//! `riftc verify`: check a config file and print what it would register.

use anyhow::Result;
use rift_client::ClientConfig;

pub fn run(config: &ClientConfig) -> Result<()> {
    config.validate()?;

    println!("server {}", config.common.server_endpoint());
    if config.proxies.is_empty() && config.visitors.is_empty() {
        println!("no proxies or visitors configured");
        return Ok(());
    }

    println!("{:<20} {:<8} {:<22} {}", "PROXY", "TYPE", "LOCAL", "REMOTE");
    for p in &config.proxies {
        let remote = match p.proxy_type.as_str() {
            "tcp" | "udp" if p.remote_port == 0 => "(server assigned)".to_string(),
            "tcp" | "udp" => format!(":{}", p.remote_port),
            "http" | "https" => {
                let mut domains = p.custom_domains.clone();
                if !p.subdomain.is_empty() {
                    domains.push(format!("{}.*", p.subdomain));
                }
                domains.join(",")
            }
            _ => "(visitors only)".to_string(),
        };
        println!("{:<20} {:<8} {:<22} {}", p.name, p.proxy_type, p.local_endpoint(), remote);
    }

    if !config.visitors.is_empty() {
        println!();
        println!("{:<20} {:<8} {:<22} {}", "VISITOR", "TYPE", "BIND", "PROXY");
        for v in &config.visitors {
            println!("{:<20} {:<8} {:<22} {}", v.name, v.visitor_type, v.bind_endpoint(), v.server_name);
        }
    }
    Ok(())
}
