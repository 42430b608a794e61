//
// This example walks through building automated rules: template rules,
// archive rules, decoding from JSON and the errors the builder reports.
//
// Run with: cargo run --example rule_builder_usage

use rule_engine::{CompiledEvaluator, MatchExpressionEvaluator, RuleBuilder, RuleError, Target};

fn main() {
    println!("=== Rule Builder - Examples ===\n");

    let evaluator = CompiledEvaluator::new();

    // ========================================================================
    // Example 1: Template rule
    // ========================================================================
    println!("Example 1: Template rule");
    println!("------------------------");

    let rule = RuleBuilder::new()
        .name("Continuous Web")
        .description("Always record the web tier")
        .match_expression("target.labels['tier'] == 'web'")
        .event_specifier("template=Continuous,type=TARGET")
        .max_age_seconds(3600)
        .archival_period_seconds(300)
        .preserved_archives(5)
        .build(&evaluator);

    match &rule {
        Ok(rule) => {
            println!("  Built: {}", rule);
            println!("  Recording name: {}", rule.recording_name());
        }
        Err(e) => println!("  Rejected: {}", e),
    }
    println!();

    // ========================================================================
    // Example 2: Evaluating against targets
    // ========================================================================
    println!("Example 2: Evaluation");
    println!("---------------------");

    let web = Target::new("localhost:9091", "web-1").with_label("tier", "web");
    let db = Target::new("localhost:9092", "db-1").with_label("tier", "db");
    if let Ok(rule) = &rule {
        for target in [&web, &db] {
            let matched = evaluator
                .evaluate(rule.match_expression(), target)
                .unwrap_or(false);
            println!("  {} matches: {}", target.alias(), matched);
        }
    }
    println!();

    // ========================================================================
    // Example 3: Archive rule without a name
    // ========================================================================
    println!("Example 3: Unnamed archive rule");
    println!("-------------------------------");

    match RuleBuilder::new()
        .match_expression("target.alias == 'db-1'")
        .event_specifier("archive")
        .build(&evaluator)
    {
        Ok(rule) => println!("  Derived name: {}", rule.name()),
        Err(e) => println!("  Rejected: {}", e),
    }
    println!();

    // ========================================================================
    // Example 4: Decoding and validation errors
    // ========================================================================
    println!("Example 4: Errors");
    println!("-----------------");

    let json = r#"{"name":"bad","matchExpression":"System.exit(1)","eventSpecifier":"template=ALL"}"#;
    let attempts = [
        RuleBuilder::from_json(json),
        Ok(RuleBuilder::new()
            .name("archiver")
            .match_expression("true")
            .event_specifier("archive")
            .preserved_archives(3)),
        Ok(RuleBuilder::new()
            .name("typo")
            .match_expression("true")
            .event_specifier("tenplate=typo")),
    ];

    for attempt in attempts {
        let result = attempt.and_then(|builder| builder.build(&evaluator));
        match result {
            Ok(rule) => println!("  Unexpectedly built {}", rule),
            Err(RuleError::MatchExpressionValidation(e)) => println!("  Expression: {}", e),
            Err(RuleError::IllegalArgument(msg)) => println!("  Argument: {}", msg),
        }
    }
}
