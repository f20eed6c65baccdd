//! Built-in functions of the expression language
//!
//! All functions are pure over their arguments and the seeded RNG.

use super::Value;
use crate::errors::{Result, Test161Error};
use rand::rngs::StdRng;
use rand::Rng;

const RAND_STRING_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Names accepted in function position.
pub const FUNCTIONS: &[&str] = &[
    "add",
    "atoi",
    "factorial",
    "randInt",
    "randString",
    "ranger",
    "index",
    "len",
];

pub fn is_function(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

pub fn call(name: &str, args: Vec<Value>, rng: &mut StdRng) -> Result<Value> {
    match name {
        "add" => {
            if args.is_empty() {
                return Err(arity(name, "at least 1", 0));
            }
            let mut sum: i64 = 0;
            for a in &args {
                sum = sum
                    .checked_add(a.as_int()?)
                    .ok_or_else(|| Test161Error::Expression("add overflow".to_string()))?;
            }
            Ok(Value::Int(sum))
        }
        "atoi" => {
            let [s] = exact::<1>(name, args)?;
            match s {
                Value::Int(i) => Ok(Value::Int(i)),
                other => {
                    let text = other.to_string();
                    text.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        Test161Error::Expression(format!("atoi: invalid integer {:?}", text))
                    })
                }
            }
        }
        "factorial" => {
            let [n] = exact::<1>(name, args)?;
            let n = n.as_int()?;
            if n < 0 {
                return Err(Test161Error::Expression(format!(
                    "factorial of negative number {}",
                    n
                )));
            }
            let mut acc: i64 = 1;
            for i in 2..=n {
                acc = acc.checked_mul(i).ok_or_else(|| {
                    Test161Error::Expression(format!("factorial({}) overflows", n))
                })?;
            }
            Ok(Value::Int(acc))
        }
        "randInt" => {
            let [min, max] = exact::<2>(name, args)?;
            let (min, max) = (min.as_int()?, max.as_int()?);
            if min > max {
                return Err(Test161Error::Expression(format!(
                    "randInt: empty range {}..{}",
                    min, max
                )));
            }
            Ok(Value::Int(rng.gen_range(min..=max)))
        }
        "randString" => {
            let [min, max] = exact::<2>(name, args)?;
            let (min, max) = (min.as_int()?, max.as_int()?);
            if min < 0 || min > max {
                return Err(Test161Error::Expression(format!(
                    "randString: invalid length range {}..{}",
                    min, max
                )));
            }
            let len = rng.gen_range(min..=max) as usize;
            let s: String = (0..len)
                .map(|_| {
                    let i = rng.gen_range(0..RAND_STRING_ALPHABET.len());
                    RAND_STRING_ALPHABET[i] as char
                })
                .collect();
            Ok(Value::Str(s))
        }
        "ranger" => {
            let [n] = exact::<1>(name, args)?;
            let n = n.as_int()?;
            Ok(Value::List((0..n.max(0)).map(Value::Int).collect()))
        }
        "index" => {
            let [list, i] = exact::<2>(name, args)?;
            let i = i.as_int()?;
            match list {
                Value::List(items) => usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| {
                        Test161Error::Expression(format!(
                            "index {} out of range (len {})",
                            i,
                            items.len()
                        ))
                    }),
                other => Err(Test161Error::Expression(format!(
                    "index of non-list value {}",
                    other
                ))),
            }
        }
        "len" => {
            let [v] = exact::<1>(name, args)?;
            match v {
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                other => Err(Test161Error::Expression(format!("len of {}", other))),
            }
        }
        other => Err(Test161Error::Expression(format!(
            "unknown function {}",
            other
        ))),
    }
}

fn exact<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N]> {
    let got = args.len();
    args.try_into()
        .map_err(|_| arity(name, &N.to_string(), got))
}

fn arity(name: &str, want: &str, got: usize) -> Test161Error {
    Test161Error::Expression(format!(
        "{} expects {} argument(s), got {}",
        name, want, got
    ))
}
