use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(String),
}

/// A text template with `{{name}}` placeholders.
///
/// Rendering is a single pass over pre-parsed segments: substituted values
/// are inserted verbatim and never rescanned for placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

pub type Vars = BTreeMap<&'static str, String>;

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| anyhow!("unterminated placeholder in template: {:?}", text))?;
            let name = after[..close].trim();
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(anyhow!("invalid placeholder name {:?}", name));
            }
            segments.push(Segment::Var(name.to_string()));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn render(&self, vars: &Vars) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Var(name) => {
                    let value = vars
                        .get(name.as_str())
                        .ok_or_else(|| anyhow!("no value for placeholder {{{{{}}}}}", name))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// An argv template: one `Template` per argument, so substituted values can
/// never introduce extra arguments or shell syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<Template>,
}

impl CommandTemplate {
    pub fn parse(argv: &[String]) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("command template must not be empty"))?;
        if program.contains("{{") {
            return Err(anyhow!("program name must be literal, got {:?}", program));
        }
        let args = rest
            .iter()
            .map(|a| Template::parse(a))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            program: program.clone(),
            args,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn render_args(&self, vars: &Vars) -> Result<Vec<String>> {
        self.args.iter().map(|t| t.render(vars)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> Vars {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn renders_placeholders_once() {
        let t = Template::parse("model={{model}} prompt={{ prompt }}").expect("parse");
        let out = t
            .render(&vars(&[("model", "sonnet"), ("prompt", "{{model}} $(rm -rf /)")]))
            .expect("render");
        assert_eq!(out, "model=sonnet prompt={{model}} $(rm -rf /)");
    }

    #[test]
    fn missing_value_is_an_error() {
        let t = Template::parse("{{suite}}").expect("parse");
        let err = t.render(&Vars::new()).expect_err("must fail");
        assert!(err.to_string().contains("{{suite}}"), "{}", err);
    }

    #[test]
    fn rejects_malformed_placeholders() {
        assert!(Template::parse("{{unterminated").is_err());
        assert!(Template::parse("{{}}").is_err());
        assert!(Template::parse("{{bad name}}").is_err());
    }

    #[test]
    fn command_template_keeps_argument_boundaries() {
        let argv: Vec<String> = ["claude", "-p", "--model", "{{model}}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cmd = CommandTemplate::parse(&argv).expect("parse");
        let args = cmd
            .render_args(&vars(&[("model", "opus --dangerous")]))
            .expect("render");
        assert_eq!(cmd.program(), "claude");
        assert_eq!(args, vec!["-p", "--model", "opus --dangerous"]);
    }

    #[test]
    fn command_template_rejects_templated_program() {
        let argv = vec!["{{bin}}".to_string()];
        assert!(CommandTemplate::parse(&argv).is_err());
        assert!(CommandTemplate::parse(&[]).is_err());
    }
}
