//! Compile rule source into a capability object.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Map;

use super::ast::{Expr, RuleDecl, Stmt};
use super::eval::Evaluator;
use super::parser::parse;
use super::{Capability, Facts, RuleAction, RuleCondition, RuleObject};
use crate::config::{RuleCacheConfig, TieBreak};
use crate::error::{source_excerpt, FactError, FactResult};

/// Instantiated rule declaration
struct ScriptRule {
    name: String,
    fields: Facts,
    condition: Option<Expr>,
    body: Option<Vec<Stmt>>,
    max_steps: usize,
}

impl RuleCondition for ScriptRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, facts: &Facts) -> FactResult<bool> {
        match &self.condition {
            Some(condition) => Evaluator::new(&self.fields, self.max_steps).test(condition, facts),
            None => Err(FactError::ScriptRuntime(format!("rule {} has no when clause", self.name))),
        }
    }
}

impl RuleAction for ScriptRule {
    fn name(&self) -> &str {
        &self.name
    }

    /// Runs the `then` block, guarded by the `when` clause if there is one
    fn execute(&self, facts: &mut Facts) -> FactResult<()> {
        let mut evaluator = Evaluator::new(&self.fields, self.max_steps);
        if let Some(condition) = &self.condition {
            if !evaluator.test(condition, facts)? {
                return Ok(());
            }
        }
        match &self.body {
            Some(body) => evaluator.exec(body, facts),
            None => Err(FactError::ScriptRuntime(format!("rule {} has no then block", self.name))),
        }
    }
}

fn check_declared(rule: &RuleDecl) -> Result<(), String> {
    for capability in &rule.declared {
        let satisfied = match capability {
            Capability::Condition => rule.condition.is_some(),
            Capability::Action => rule.body.is_some(),
        };
        if !satisfied {
            let member = match capability {
                Capability::Condition => "a when clause",
                Capability::Action => "a then block",
            };
            return Err(format!(
                "line {}: rule {} declares {} but has no {}",
                rule.line,
                rule.name,
                capability.marker(),
                member
            ));
        }
    }
    Ok(())
}

/// Evaluate the `let` fields; they see earlier fields but no facts
fn instantiate(
    rule: &RuleDecl,
    capability: Capability,
    max_steps: usize,
) -> FactResult<RuleObject> {
    let mut fields = Map::new();
    for (field, expr) in &rule.fields {
        let value = Evaluator::new(&fields, max_steps).eval(expr, &Map::new())?;
        fields.insert(field.clone(), value);
    }

    let instance = Arc::new(ScriptRule {
        name: rule.name.clone(),
        fields,
        condition: rule.condition.clone(),
        body: rule.body.clone(),
        max_steps,
    });
    Ok(match capability {
        Capability::Action => RuleObject::Action(instance),
        Capability::Condition => RuleObject::Condition(instance),
    })
}

/// Compile `source` and instantiate the rule serving `capability`
///
/// `name` only labels errors and log lines.
pub(crate) fn compile(
    name: &str,
    source: &str,
    capability: Capability,
    config: &RuleCacheConfig,
) -> FactResult<RuleObject> {
    let compile_error = |cause: String| FactError::ScriptCompile {
        name: name.to_string(),
        source_excerpt: source_excerpt(source),
        cause,
    };

    if source.len() > config.max_source_len {
        return Err(compile_error(format!(
            "source is {} bytes, the limit is {}",
            source.len(),
            config.max_source_len
        )));
    }

    let rules = parse(source, config.max_expr_depth).map_err(|e| compile_error(e.to_string()))?;
    for rule in &rules {
        check_declared(rule).map_err(compile_error)?;
    }

    let candidates: Vec<&RuleDecl> = rules
        .iter()
        .filter(|rule| !rule.is_marker() && rule.capabilities().contains(&capability))
        .collect();

    let chosen = match candidates.as_slice() {
        [] => {
            return Err(FactError::NoMatchingCapability {
                name: name.to_string(),
                capability,
            })
        }
        [only] => *only,
        [.., last] => {
            let names: Vec<String> = candidates.iter().map(|rule| rule.name.clone()).collect();
            warn!(
                "Rule script {} declares {} rules implementing {}: {}",
                name,
                names.len(),
                capability,
                names.join(", ")
            );
            match config.tie_break {
                TieBreak::LastDeclared => *last,
                TieBreak::RequireUnique => {
                    return Err(FactError::AmbiguousCapability {
                        name: name.to_string(),
                        capability,
                        candidates: names,
                    })
                }
            }
        }
    };

    debug!("Rule script {} selected rule {} for {}", name, chosen.name, capability);
    instantiate(chosen, capability, config.max_eval_steps)
        .map_err(|e| compile_error(format!("instantiating rule {}: {}", chosen.name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn facts(value: Value) -> Facts {
        match value {
            Value::Object(map) => map,
            _ => panic!("facts must be an object"),
        }
    }

    fn config() -> RuleCacheConfig {
        RuleCacheConfig::new()
    }

    #[test]
    fn test_condition() {
        let object = compile(
            "big",
            "rule Big { let limit = 10 * 10; when order.amount > limit; }",
            Capability::Condition,
            &config(),
        )
        .unwrap();

        assert_eq!(object.name(), "Big");
        let condition = object.as_condition().unwrap();
        assert!(condition.evaluate(&facts(json!({"order": {"amount": 150}}))).unwrap());
        assert!(!condition.evaluate(&facts(json!({"order": {"amount": 50}}))).unwrap());
    }

    #[test]
    fn test_action_is_guarded_by_when() {
        let object = compile(
            "tag",
            "rule Tag { when level >= 3; then { set alert = upper(level_name); } }",
            Capability::Action,
            &config(),
        )
        .unwrap();
        let action = object.as_action().unwrap();

        let mut quiet = facts(json!({"level": 1, "level_name": "info"}));
        action.execute(&mut quiet).unwrap();
        assert!(!quiet.contains_key("alert"));

        let mut loud = facts(json!({"level": 4, "level_name": "error"}));
        action.execute(&mut loud).unwrap();
        assert_eq!(loud["alert"], json!("ERROR"));
    }

    #[test]
    fn test_markers_are_skipped() {
        let source = "rule Condition { when true; } rule Real { when false; }";
        let object = compile("m", source, Capability::Condition, &config()).unwrap();
        assert_eq!(object.name(), "Real");

        let err =
            compile("m", "rule Action { then { } }", Capability::Action, &config()).unwrap_err();
        assert!(matches!(err, FactError::NoMatchingCapability { .. }));
    }

    #[test]
    fn test_declared_capabilities() {
        let only_condition = "rule Check: Condition { when true; then { set x = 1; } }";
        let err = compile("c", only_condition, Capability::Action, &config()).unwrap_err();
        assert_eq!(
            err,
            FactError::NoMatchingCapability {
                name: "c".to_string(),
                capability: Capability::Action,
            }
        );

        let unsatisfied = "rule Check: Action { when true; }";
        let err = compile("c", unsatisfied, Capability::Condition, &config()).unwrap_err();
        assert!(matches!(err, FactError::ScriptCompile { .. }));
    }

    #[test]
    fn test_tie_break() {
        let source = "rule First { when true; } rule Second { when false; }";
        let object = compile("t", source, Capability::Condition, &config()).unwrap();
        assert_eq!(object.name(), "Second");

        let strict = config().tie_break(TieBreak::RequireUnique);
        let err = compile("t", source, Capability::Condition, &strict).unwrap_err();
        assert_eq!(
            err,
            FactError::AmbiguousCapability {
                name: "t".to_string(),
                capability: Capability::Condition,
                candidates: vec!["First".to_string(), "Second".to_string()],
            }
        );
    }

    #[test]
    fn test_compile_errors_carry_excerpt() {
        let source = "rule Broken { when ; }";
        let err = compile("broken", source, Capability::Condition, &config()).unwrap_err();
        match err {
            FactError::ScriptCompile {
                name,
                source_excerpt,
                cause,
            } => {
                assert_eq!(name, "broken");
                assert_eq!(source_excerpt, "rule Broken { when ; }");
                assert!(cause.contains("line 1"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let source = "rule F { let x = 1 / 0; when x; }";
        let err = compile("bad_field", source, Capability::Condition, &config()).unwrap_err();
        assert!(matches!(err, FactError::ScriptCompile { .. }));

        let tiny = config().max_source_len(8);
        let err =
            compile("long", "rule L { when true; }", Capability::Condition, &tiny).unwrap_err();
        assert!(matches!(err, FactError::ScriptCompile { .. }));
    }

    #[test]
    fn test_step_budget_applies_to_evaluation() {
        let object = compile(
            "steps",
            "rule S { when len([1, 2, 3, 4, 5, 6, 7, 8]) > 0; }",
            Capability::Condition,
            &config().max_eval_steps(4),
        )
        .unwrap();
        let result = object.as_condition().unwrap().evaluate(&Facts::new());
        assert!(matches!(result, Err(FactError::ScriptRuntime(_))));
    }
}
