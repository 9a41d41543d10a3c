use crate::user::{Group, User};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

impl<'de> Deserialize<'de> for User {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.as_str().into())
    }
}

impl Serialize for User {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Uid(uid) => serializer.collect_str(uid),
            Self::Name(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Group {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.as_str().into())
    }
}

impl Serialize for Group {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Gid(gid) => serializer.collect_str(gid),
            Self::Name(name) => serializer.serialize_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_test::{Token, assert_de_tokens, assert_tokens};

    #[test]
    fn user_name() {
        assert_tokens(&User::from("daemon"), &[Token::Str("daemon")]);
    }

    #[test]
    fn user_id() {
        assert_de_tokens(&User::from(1000_u32), &[Token::Str("1000")]);
    }

    #[test]
    fn group_name() {
        assert_tokens(&Group::from("daemon"), &[Token::Str("daemon")]);
    }

    #[test]
    fn group_id() {
        assert_de_tokens(&Group::from(0_u32), &[Token::String("0")]);
    }
}
