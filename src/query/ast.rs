use serde::Serialize;

/// A queryable field. Aliases resolve case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Message,
    Service,
    Level,
    Tags,
    CreatedAt,
    Id,
}

impl Field {
    pub fn resolve(name: &str) -> Option<Field> {
        match name.to_ascii_lowercase().as_str() {
            "message" | "msg" => Some(Field::Message),
            "service" | "svc" => Some(Field::Service),
            "level" | "lvl" => Some(Field::Level),
            "tags" | "tag" => Some(Field::Tags),
            "created_at" => Some(Field::CreatedAt),
            "id" => Some(Field::Id),
            _ => None,
        }
    }

    /// The entries column backing this field. `Tags` lives inside the
    /// context JSON and has no column of its own.
    pub fn column(&self) -> Option<&'static str> {
        match self {
            Field::Message => Some("message"),
            Field::Service => Some("service"),
            Field::Level => Some("level"),
            Field::CreatedAt => Some("timestamp"),
            Field::Id => Some("id"),
            Field::Tags => None,
        }
    }
}

/// Query AST. `And`/`Or` are left-associative as parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Node {
    FieldEq(Field, String),
    FieldContains(Field, String),
    Regex(Field, String),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
}

#[derive(Clone, Copy, PartialEq)]
enum ChainOp {
    And,
    Or,
}

/// Semantics-preserving normalization: flatten nested same-operator chains
/// and collapse duplicate operands (`Or(X, X)` → `X`, `And(X, X)` → `X`).
pub fn optimize(node: Node) -> Node {
    match node {
        Node::And(..) => rebuild_chain(node, ChainOp::And),
        Node::Or(..) => rebuild_chain(node, ChainOp::Or),
        Node::Not(child) => Node::Not(Box::new(optimize(*child))),
        leaf => leaf,
    }
}

fn rebuild_chain(node: Node, op: ChainOp) -> Node {
    let mut operands = Vec::new();
    flatten_into(node, op, &mut operands);

    let mut unique: Vec<Node> = Vec::with_capacity(operands.len());
    for operand in operands {
        let operand = optimize(operand);
        if !unique.contains(&operand) {
            unique.push(operand);
        }
    }

    let mut iter = unique.into_iter();
    let first = iter.next().expect("chain has at least one operand");
    iter.fold(first, |acc, next| match op {
        ChainOp::And => Node::And(Box::new(acc), Box::new(next)),
        ChainOp::Or => Node::Or(Box::new(acc), Box::new(next)),
    })
}

fn flatten_into(node: Node, op: ChainOp, out: &mut Vec<Node>) {
    match (node, op) {
        (Node::And(l, r), ChainOp::And) => {
            flatten_into(*l, op, out);
            flatten_into(*r, op, out);
        }
        (Node::Or(l, r), ChainOp::Or) => {
            flatten_into(*l, op, out);
            flatten_into(*r, op, out);
        }
        (other, _) => out.push(other),
    }
}
