pub mod target;
pub mod match_expression;
pub mod rule;

pub use target::{
    ConnectionDescriptor, Credentials, Target, TargetId,
};

pub use match_expression::{
    Attribute,                  // Attribute namespace exposed to expressions
    ComparisonOp,               // Comparison operators
    CompiledEvaluator,          // Default caching evaluator
    FieldComparison,            // Single comparison node
    FieldValue,                 // Runtime comparison values
    IllegalMatchExpression,     // Static validation failure
    MatchExpression,            // Compiled predicate tree
    MatchExpressionEvaluator,   // Evaluator contract
    Operand,                    // Comparison operand
};

pub use rule::{
    sanitize_rule_name,
    EventSpecifier,             // archive | template=<name>
    Rule,                       // Validated, immutable rule
    RuleBuilder,                // Validating constructor
    RuleError,                  // Construction errors
    TemplateType,               // TARGET | CUSTOM
    ARCHIVE_EVENT,
    RECORDING_NAME_PREFIX,
};
