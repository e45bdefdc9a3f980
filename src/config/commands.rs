use std::collections::BTreeSet;

use super::Config;
use crate::supervisor::ProcessSpec;

/// rtl_tcp invocation, `None` when the configured server is remote
pub fn rtltcp_spec(config: &Config) -> Option<ProcessSpec> {
    if !config.general.rtltcp_is_local() {
        return None;
    }

    let (host, port) = config.general.rtltcp_address().ok()?;
    let mut args = vec![
        "-a".to_string(), host.trim_matches(|c| c == '[' || c == ']').to_string(),
        "-p".to_string(), port.to_string(),
    ];
    if config.general.device_id != "single" {
        args.push("-d".to_string());
        args.push(config.general.device_id.clone());
    }
    args.extend(config.custom_parameters.rtltcp.split_whitespace().map(str::to_string));

    return Some(ProcessSpec::new("rtl_tcp", &config.general.rtltcp_path, args));
}

/// rtlamr invocation. Outside listen mode it is narrowed down to the
/// configured protocols and meter ids.
pub fn rtlamr_spec(config: &Config, listen_all: bool) -> ProcessSpec {
    let mut args = vec![
        format!("-server={}", config.general.rtltcp_server),
        "-format=json".to_string(),
    ];

    if listen_all {
        let msgtype = config.general.msgtype.clone().unwrap_or("all".to_string());
        args.push(format!("-msgtype={msgtype}"));
    } else {
        let protocols: BTreeSet<String> = config.meters.iter().map(|m| m.protocol.to_string()).collect();
        let ids: BTreeSet<&str> = config.meters.iter().map(|m| m.id.as_str()).collect();
        args.push(format!("-msgtype={}", protocols.into_iter().collect::<Vec<_>>().join(",")));
        args.push(format!("-filterid={}", ids.into_iter().collect::<Vec<_>>().join(",")));
    }
    args.extend(config.custom_parameters.rtlamr.split_whitespace().map(str::to_string));

    return ProcessSpec::new("rtlamr", &config.general.rtlamr_path, args);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeterConfig;
    use crate::models::MeterProtocol;

    fn meter(id: &str, protocol: MeterProtocol) -> MeterConfig {
        MeterConfig {
            id: id.to_string(),
            protocol,
            name: format!("meter_{id}"),
            format: None,
            unit_of_measurement: None,
            icon: None,
            device_class: None,
            state_class: None,
        }
    }

    #[test]
    fn test_rtltcp_local() {
        let mut config = Config::defaults();
        config.general.device_id = "1".to_string();
        let spec = rtltcp_spec(&config).unwrap();
        assert_eq!(spec.name, "rtl_tcp");
        assert_eq!(spec.args, vec!["-a", "127.0.0.1", "-p", "1234", "-d", "1", "-s", "2048000"]);
    }

    #[test]
    fn test_rtltcp_remote() {
        let mut config = Config::defaults();
        config.general.rtltcp_server = "10.1.1.5:1234".to_string();
        assert!(rtltcp_spec(&config).is_none());
    }

    #[test]
    fn test_rtlamr_filters_meters() {
        let mut config = Config::defaults();
        config.meters = vec![meter("7823010", MeterProtocol::ScmPlus), meter("6567984", MeterProtocol::Scm)];
        let spec = rtlamr_spec(&config, false);
        assert_eq!(spec.args, vec![
            "-server=127.0.0.1:1234",
            "-format=json",
            "-msgtype=scm,scm+",
            "-filterid=6567984,7823010",
            "-unique=true",
        ]);
    }

    #[test]
    fn test_rtlamr_listen_all() {
        let mut config = Config::defaults();
        config.custom_parameters.rtlamr = "".to_string();
        assert_eq!(rtlamr_spec(&config, true).args, vec!["-server=127.0.0.1:1234", "-format=json", "-msgtype=all"]);

        config.general.msgtype = Some("idm".to_string());
        assert!(rtlamr_spec(&config, true).args.contains(&"-msgtype=idm".to_string()));
    }
}
