//! 命令白名单
//!
//! 每个操作类型对应一条规则：命令模板 + 每个占位符的校验正则 + 参数最大长度。
//! 规则表在启动时构建，之后不可变。只校验被替换进去的参数，
//! 静态模板文本（例如 `&&` 串联的 apt 命令）不受元字符检查约束。

pub mod template;

use regex::Regex;
use std::collections::HashMap;

use crate::error::ExecError;
use crate::models::target::{sanitize_label, ActionType};
pub use template::{CommandTemplate, TemplateError, Token};

/// 参数中禁止出现的 shell 元字符
pub const SHELL_METACHARACTERS: [char; 10] = [';', '|', '&', '`', '$', '(', ')', '>', '<', '\n'];

/// 参数默认最大长度
pub const DEFAULT_MAX_PARAM_LEN: usize = 64;

/// 规则表构建错误
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule {action}: {source}")]
    Template {
        action: ActionType,
        #[source]
        source: TemplateError,
    },

    #[error("rule {action}: placeholder '{placeholder}' has no validation rule")]
    MissingValidator { action: ActionType, placeholder: String },

    #[error("rule {action}: invalid regex for '{placeholder}': {source}")]
    InvalidRegex {
        action: ActionType,
        placeholder: String,
        #[source]
        source: regex::Error,
    },

    #[error("duplicate rule for {0}")]
    Duplicate(ActionType),
}

/// 单条白名单规则
#[derive(Debug, Clone)]
pub struct WhitelistRule {
    action: ActionType,
    template: CommandTemplate,
    validators: HashMap<String, Regex>,
    max_param_len: usize,
}

impl WhitelistRule {
    /// 构建规则；每个占位符都必须有校验正则
    pub fn new(
        action: ActionType,
        pattern: &str,
        validators: &[(&str, &str)],
        max_param_len: usize,
    ) -> Result<Self, RuleError> {
        let template = CommandTemplate::parse(pattern)
            .map_err(|source| RuleError::Template { action, source })?;

        let mut compiled = HashMap::new();
        for (name, expr) in validators {
            let regex = Regex::new(expr).map_err(|source| RuleError::InvalidRegex {
                action,
                placeholder: name.to_string(),
                source,
            })?;
            compiled.insert(name.to_string(), regex);
        }

        for placeholder in template.placeholders() {
            if !compiled.contains_key(placeholder) {
                return Err(RuleError::MissingValidator {
                    action,
                    placeholder: placeholder.to_string(),
                });
            }
        }

        Ok(Self {
            action,
            template,
            validators: compiled,
            max_param_len,
        })
    }

    pub fn action(&self) -> ActionType {
        self.action
    }

    pub fn pattern(&self) -> &str {
        self.template.source()
    }

    pub fn max_param_len(&self) -> usize {
        self.max_param_len
    }

    /// 替换并校验参数，返回最终命令
    pub fn resolve(&self, params: &HashMap<String, String>) -> Result<String, ExecError> {
        let placeholders = self.template.placeholders();
        if placeholders.is_empty() {
            return self.render(params);
        }

        // 先确认所有占位符都有参数
        for name in &placeholders {
            if !params.contains_key(*name) {
                return Err(ExecError::MissingParameter {
                    action: self.action.to_string(),
                    parameter: name.to_string(),
                });
            }
        }

        // 元字符检查只针对被替换的参数值
        for name in &placeholders {
            let value = &params[*name];
            if let Some(character) = value.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
                return Err(ExecError::ShellMetacharacterRejected {
                    parameter: name.to_string(),
                    character,
                });
            }
        }

        for name in &placeholders {
            let value = &params[*name];
            if value.len() > self.max_param_len {
                return Err(ExecError::ParameterValidationFailed {
                    parameter: name.to_string(),
                    reason: format!("longer than {} bytes", self.max_param_len),
                });
            }
            let matches = self
                .validators
                .get(*name)
                .map(|regex| regex.is_match(value))
                .unwrap_or(false);
            if !matches {
                return Err(ExecError::ParameterValidationFailed {
                    parameter: name.to_string(),
                    reason: "does not match the allowed pattern".to_string(),
                });
            }
        }

        self.render(params)
    }

    fn render(&self, params: &HashMap<String, String>) -> Result<String, ExecError> {
        self.template
            .render(params)
            .map_err(|parameter| ExecError::MissingParameter {
                action: self.action.to_string(),
                parameter,
            })
    }
}

const SERVICE_NAME: &str = r"^[a-zA-Z0-9_-]+$";
const CONTAINER_NAME: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$";
const LINE_COUNT: &str = r"^[1-9][0-9]{0,3}$";
const RETENTION: &str = r"^[1-9][0-9]{0,3}[smhd]$";

/// 不可变的白名单规则表
#[derive(Debug, Clone)]
pub struct CommandWhitelist {
    rules: HashMap<ActionType, WhitelistRule>,
}

impl CommandWhitelist {
    /// 由规则列表构建
    pub fn from_rules(rules: Vec<WhitelistRule>) -> Result<Self, RuleError> {
        let mut table = HashMap::new();
        for rule in rules {
            let action = rule.action;
            if table.insert(action, rule).is_some() {
                return Err(RuleError::Duplicate(action));
            }
        }
        Ok(Self { rules: table })
    }

    /// 内置规则表
    pub fn builtin() -> Result<Self, RuleError> {
        use ActionType::*;
        let max = DEFAULT_MAX_PARAM_LEN;

        Self::from_rules(vec![
            WhitelistRule::new(RestartService, "systemctl restart {service_name}", &[("service_name", SERVICE_NAME)], max)?,
            WhitelistRule::new(StartService, "systemctl start {service_name}", &[("service_name", SERVICE_NAME)], max)?,
            WhitelistRule::new(StopService, "systemctl stop {service_name}", &[("service_name", SERVICE_NAME)], max)?,
            WhitelistRule::new(
                ServiceStatus,
                "systemctl status {service_name} --no-pager",
                &[("service_name", SERVICE_NAME)],
                max,
            )?,
            WhitelistRule::new(
                ServiceLogs,
                "journalctl -u {service_name} -n {lines} --no-pager",
                &[("service_name", SERVICE_NAME), ("lines", LINE_COUNT)],
                max,
            )?,
            WhitelistRule::new(
                ApplyUpdates,
                "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get upgrade -y",
                &[],
                max,
            )?,
            WhitelistRule::new(ClearLogs, "journalctl --vacuum-time={retention}", &[("retention", RETENTION)], max)?,
            WhitelistRule::new(DockerStart, "docker start {container}", &[("container", CONTAINER_NAME)], max)?,
            WhitelistRule::new(DockerStop, "docker stop {container}", &[("container", CONTAINER_NAME)], max)?,
            WhitelistRule::new(DockerRestart, "docker restart {container}", &[("container", CONTAINER_NAME)], max)?,
            WhitelistRule::new(
                DockerLogs,
                "docker logs --tail {lines} {container}",
                &[("container", CONTAINER_NAME), ("lines", LINE_COUNT)],
                max,
            )?,
            WhitelistRule::new(DiskUsage, "df -h", &[], max)?,
            WhitelistRule::new(Reboot, "systemctl reboot", &[], max)?,
        ])
    }

    pub fn rule(&self, action: ActionType) -> Option<&WhitelistRule> {
        self.rules.get(&action)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 把操作类型 + 参数解析为确切的命令字符串（纯函数，无 I/O）
    pub fn resolve(&self, action: &str, params: &HashMap<String, String>) -> Result<String, ExecError> {
        let unknown = || ExecError::UnknownActionType {
            action: sanitize_label(action),
        };
        let action_type: ActionType = action.parse().map_err(|_| unknown())?;
        let rule = self.rules.get(&action_type).ok_or_else(unknown)?;
        rule.resolve(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn whitelist() -> CommandWhitelist {
        CommandWhitelist::builtin().unwrap()
    }

    #[test]
    fn test_builtin_covers_every_action() {
        let wl = whitelist();
        assert_eq!(wl.len(), ActionType::ALL.len());
        for action in ActionType::ALL {
            assert!(wl.rule(action).is_some(), "missing rule for {}", action);
        }
    }

    #[test]
    fn test_resolve_valid_requests() {
        let wl = whitelist();
        let cases: &[(&str, &[(&str, &str)], &str)] = &[
            ("restart_service", &[("service_name", "nginx")], "systemctl restart nginx"),
            ("stop_service", &[("service_name", "home-assistant")], "systemctl stop home-assistant"),
            (
                "service_logs",
                &[("service_name", "sshd"), ("lines", "200")],
                "journalctl -u sshd -n 200 --no-pager",
            ),
            (
                "apply_updates",
                &[],
                "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get upgrade -y",
            ),
            ("clear_logs", &[("retention", "7d")], "journalctl --vacuum-time=7d"),
            ("docker_start", &[("container", "jellyfin")], "docker start jellyfin"),
            (
                "docker_logs",
                &[("container", "pihole.v6"), ("lines", "50")],
                "docker logs --tail 50 pihole.v6",
            ),
            ("disk_usage", &[], "df -h"),
        ];

        for (action, pairs, expected) in cases {
            let command = wl.resolve(action, &params(pairs)).unwrap();
            assert_eq!(&command, expected, "action {}", action);
        }
    }

    #[test]
    fn test_resolve_unknown_action() {
        let err = whitelist().resolve("rm_everything", &HashMap::new()).unwrap_err();
        assert!(matches!(err, ExecError::UnknownActionType { .. }));
    }

    #[test]
    fn test_unknown_action_is_sanitized() {
        let err = whitelist().resolve("x; reboot", &HashMap::new()).unwrap_err();
        match err {
            ExecError::UnknownActionType { action } => assert_eq!(action, "x??reboot"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_missing_parameter() {
        let err = whitelist().resolve("restart_service", &HashMap::new()).unwrap_err();
        match err {
            ExecError::MissingParameter { parameter, .. } => assert_eq!(parameter, "service_name"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_every_metacharacter_rejected() {
        let wl = whitelist();
        for c in SHELL_METACHARACTERS {
            let value = format!("nginx{}x", c);
            let err = wl
                .resolve("restart_service", &params(&[("service_name", &value)]))
                .unwrap_err();
            match err {
                ExecError::ShellMetacharacterRejected { parameter, character } => {
                    assert_eq!(parameter, "service_name");
                    assert_eq!(character, c);
                }
                other => panic!("{:?} not rejected as metacharacter: {:?}", c, other),
            }
        }
    }

    #[test]
    fn test_injection_attempt_rejected() {
        let err = whitelist()
            .resolve("restart_service", &params(&[("service_name", "nginx; rm -rf /")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ExecError::ShellMetacharacterRejected { character: ';', .. }
        ));
        assert!(!err.to_string().contains("rm -rf"));
    }

    #[test]
    fn test_parameter_validation() {
        let wl = whitelist();

        let too_long = "a".repeat(DEFAULT_MAX_PARAM_LEN + 1);
        let err = wl
            .resolve("restart_service", &params(&[("service_name", &too_long)]))
            .unwrap_err();
        assert!(matches!(err, ExecError::ParameterValidationFailed { .. }));

        let err = wl
            .resolve("restart_service", &params(&[("service_name", "../etc/passwd")]))
            .unwrap_err();
        match err {
            ExecError::ParameterValidationFailed { parameter, .. } => {
                assert_eq!(parameter, "service_name")
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = wl
            .resolve("service_logs", &params(&[("service_name", "sshd"), ("lines", "0")]))
            .unwrap_err();
        match err {
            ExecError::ParameterValidationFailed { parameter, .. } => assert_eq!(parameter, "lines"),
            other => panic!("unexpected error: {:?}", other),
        }

        let err = wl
            .resolve("restart_service", &params(&[("service_name", "nginx --now")]))
            .unwrap_err();
        assert!(matches!(err, ExecError::ParameterValidationFailed { .. }));
    }

    #[test]
    fn test_extra_parameters_ignored() {
        let command = whitelist()
            .resolve("disk_usage", &params(&[("path", "/; reboot")]))
            .unwrap();
        assert_eq!(command, "df -h");
    }

    #[test]
    fn test_rule_requires_validator_for_every_placeholder() {
        let err = WhitelistRule::new(
            ActionType::DockerLogs,
            "docker logs --tail {lines} {container}",
            &[("container", CONTAINER_NAME)],
            DEFAULT_MAX_PARAM_LEN,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::MissingValidator { ref placeholder, .. } if placeholder == "lines"));
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let rule = WhitelistRule::new(ActionType::DiskUsage, "df -h", &[], 64).unwrap();
        let err = CommandWhitelist::from_rules(vec![rule.clone(), rule]).unwrap_err();
        assert!(matches!(err, RuleError::Duplicate(ActionType::DiskUsage)));
    }

    #[test]
    fn test_resolved_commands_keep_metacharacters_in_static_text_only() {
        let wl = whitelist();
        let command = wl
            .resolve("restart_service", &params(&[("service_name", "nginx")]))
            .unwrap();
        assert!(!command.chars().any(|c| SHELL_METACHARACTERS.contains(&c)));

        let command = wl.resolve("apply_updates", &HashMap::new()).unwrap();
        assert!(command.contains("&&"));
    }
}
