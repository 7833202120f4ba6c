//! In-memory document store.
//!
//! Holds the four collections (users, beers, breweries, comments) behind
//! per-collection [`RwLock`]s. Every operation takes and releases its lock
//! synchronously, so callers can use the store from async handlers as long
//! as they do not hold results across an `.await` expecting them to stay
//! current.
//!
//! Operations spanning several collections lock them in a fixed order:
//! users, then beers, then comments.
//!
//! Documents are identified by 24-character lowercase hex ids, generated on
//! insert.
//!
//! # Example
//!
//! ```rust
//! use beerapi_server::store::Store;
//! use beerapi_server::types::NewBrewery;
//!
//! let store = Store::new();
//! let brewery = store.insert_brewery(NewBrewery {
//!     name: "BrewDog".to_string(),
//!     owner: "James Watt".to_string(),
//!     location: "Ellon".to_string(),
//! });
//!
//! assert_eq!(store.find_brewery(&brewery.id).unwrap().name, "BrewDog");
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::types::{
    is_object_id, Beer, BeerPatch, Brewery, Comment, NewBeer, NewBrewery, NewComment, NewUser,
    User, UserPatch,
};

/// Errors returned by store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No document with this id exists in the collection.
    #[error("{collection} {id} not found")]
    NotFound {
        collection: &'static str,
        id: String,
    },

    /// The id is not a 24-character hex string.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// The comment author no longer exists.
    #[error("user {0} not found")]
    AuthorNotFound(String),

    /// Another user already has this username.
    #[error("username already in use: {0}")]
    DuplicateUsername(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One page of a listing plus the size of the whole filtered collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Generates a fresh 24-character hex id.
#[must_use]
pub fn new_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(24);
    id
}

/// A single named collection of documents keyed by id.
struct Collection<T> {
    name: &'static str,
    docs: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Collection<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            docs: RwLock::new(HashMap::new()),
        }
    }

    fn check_id(id: &str) -> Result<()> {
        if is_object_id(id) {
            Ok(())
        } else {
            Err(StoreError::InvalidId(id.to_string()))
        }
    }

    fn not_found(&self, id: &str) -> StoreError {
        StoreError::NotFound {
            collection: self.name,
            id: id.to_string(),
        }
    }

    fn get(&self, id: &str) -> Result<T> {
        Self::check_id(id)?;
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| self.not_found(id))
    }

    fn contains(&self, id: &str) -> bool {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn insert(&self, id: String, doc: T) {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(id, doc);
        debug!(collection = self.name, count = docs.len(), "Document inserted");
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut T)) -> Result<T> {
        Self::check_id(id)?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let doc = docs.get_mut(id).ok_or_else(|| self.not_found(id))?;
        apply(doc);
        Ok(doc.clone())
    }

    /// Filters, sorts, then slices one page out of the collection.
    fn page<K: Ord>(
        &self,
        filter: impl Fn(&T) -> bool,
        sort_key: impl Fn(&T) -> K,
        skip: u64,
        limit: u64,
    ) -> Listing<T> {
        let mut matching: Vec<T> = self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|doc| filter(doc))
            .cloned()
            .collect();
        matching.sort_by_key(|doc| sort_key(doc));

        let total = matching.len() as u64;
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let items = matching.into_iter().skip(skip).take(limit).collect();

        Listing { items, total }
    }
}

/// The application's document store.
pub struct Store {
    users: Collection<User>,
    beers: Collection<Beer>,
    breweries: Collection<Brewery>,
    comments: Collection<Comment>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: Collection::new("user"),
            beers: Collection::new("beer"),
            breweries: Collection::new("brewery"),
            comments: Collection::new("comment"),
        }
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    /// Inserts a user whose password has already been hashed.
    pub fn insert_user(&self, input: NewUser, password_hash: String) -> Result<User> {
        // The uniqueness check and insert share one write lock.
        let mut docs = self.users.docs.write().unwrap_or_else(PoisonError::into_inner);
        if docs.values().any(|u| u.username == input.username) {
            return Err(StoreError::DuplicateUsername(input.username));
        }

        let user = User {
            id: new_id(),
            username: input.username,
            firstname: input.firstname,
            lastname: input.lastname,
            password_hash,
        };
        docs.insert(user.id.clone(), user.clone());
        debug!(user_id = %user.id, count = docs.len(), "User inserted");
        Ok(user)
    }

    pub fn find_user(&self, id: &str) -> Result<User> {
        self.users.get(id)
    }

    pub fn find_user_by_username(&self, username: &str) -> Option<User> {
        self.users
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    /// Users sorted by username.
    pub fn list_users(&self, skip: u64, limit: u64) -> Listing<User> {
        self.users
            .page(|_| true, |u| (u.username.clone(), u.id.clone()), skip, limit)
    }

    pub fn update_user(&self, id: &str, patch: UserPatch) -> Result<User> {
        Collection::<User>::check_id(id)?;
        let mut docs = self.users.docs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(username) = &patch.username {
            if docs.values().any(|u| &u.username == username && u.id != id) {
                return Err(StoreError::DuplicateUsername(username.clone()));
            }
        }

        let user = docs.get_mut(id).ok_or_else(|| self.users.not_found(id))?;
        patch.apply(user);
        Ok(user.clone())
    }

    /// Deletes a user and every comment they wrote.
    pub fn delete_user(&self, id: &str) -> Result<User> {
        Collection::<User>::check_id(id)?;
        let mut users = self.users.docs.write().unwrap_or_else(PoisonError::into_inner);
        let mut comments = self.comments.docs.write().unwrap_or_else(PoisonError::into_inner);

        let user = users.remove(id).ok_or_else(|| self.users.not_found(id))?;
        let before = comments.len();
        comments.retain(|_, c| c.user_id != id);
        debug!(
            user_id = %id,
            comments = before - comments.len(),
            "Removed comments of deleted user"
        );
        Ok(user)
    }

    // ------------------------------------------------------------------------
    // Breweries
    // ------------------------------------------------------------------------

    pub fn insert_brewery(&self, input: NewBrewery) -> Brewery {
        let brewery = Brewery {
            id: new_id(),
            name: input.name,
            owner: input.owner,
            location: input.location,
        };
        self.breweries.insert(brewery.id.clone(), brewery.clone());
        brewery
    }

    pub fn find_brewery(&self, id: &str) -> Result<Brewery> {
        self.breweries.get(id)
    }

    pub fn brewery_exists(&self, id: &str) -> bool {
        self.breweries.contains(id)
    }

    /// Breweries sorted by name.
    pub fn list_breweries(&self, skip: u64, limit: u64) -> Listing<Brewery> {
        self.breweries
            .page(|_| true, |b| (b.name.clone(), b.id.clone()), skip, limit)
    }

    // ------------------------------------------------------------------------
    // Beers
    // ------------------------------------------------------------------------

    pub fn insert_beer(&self, input: NewBeer) -> Beer {
        let beer = Beer {
            id: new_id(),
            name: input.name,
            brewery_id: input.brewery_id,
            alcohol_level: input.alcohol_level.unwrap_or_default(),
            picture: input.picture,
        };
        self.beers.insert(beer.id.clone(), beer.clone());
        beer
    }

    pub fn find_beer(&self, id: &str) -> Result<Beer> {
        self.beers.get(id)
    }

    /// Beers sorted by name, optionally restricted to one brewery.
    pub fn list_beers(&self, brewery_id: Option<&str>, skip: u64, limit: u64) -> Listing<Beer> {
        self.beers.page(
            |b| brewery_id.map_or(true, |id| b.brewery_id == id),
            |b| (b.name.clone(), b.id.clone()),
            skip,
            limit,
        )
    }

    pub fn update_beer(&self, id: &str, patch: BeerPatch) -> Result<Beer> {
        self.beers.update(id, |beer| patch.apply(beer))
    }

    /// Deletes a beer and its comments.
    pub fn delete_beer(&self, id: &str) -> Result<Beer> {
        Collection::<Beer>::check_id(id)?;
        let mut beers = self.beers.docs.write().unwrap_or_else(PoisonError::into_inner);
        let mut comments = self.comments.docs.write().unwrap_or_else(PoisonError::into_inner);

        let beer = beers.remove(id).ok_or_else(|| self.beers.not_found(id))?;
        let before = comments.len();
        comments.retain(|_, c| c.beer_id != id);
        debug!(
            beer_id = %id,
            comments = before - comments.len(),
            "Removed comments of deleted beer"
        );
        Ok(beer)
    }

    // ------------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------------

    /// Adds a comment by an existing user to an existing beer, dated now.
    ///
    /// The author and beer checks hold their read locks until the comment is
    /// stored, so a concurrent delete cannot leave it orphaned.
    pub fn insert_comment(&self, beer_id: &str, user_id: &str, input: NewComment) -> Result<Comment> {
        let users = self.users.docs.read().unwrap_or_else(PoisonError::into_inner);
        if !users.contains_key(user_id) {
            return Err(StoreError::AuthorNotFound(user_id.to_string()));
        }

        Collection::<Beer>::check_id(beer_id)?;
        let beers = self.beers.docs.read().unwrap_or_else(PoisonError::into_inner);
        if !beers.contains_key(beer_id) {
            return Err(self.beers.not_found(beer_id));
        }

        let comment = Comment {
            id: new_id(),
            beer_id: beer_id.to_string(),
            user_id: user_id.to_string(),
            body: input.body,
            date: Utc::now(),
        };
        let mut comments = self.comments.docs.write().unwrap_or_else(PoisonError::into_inner);
        comments.insert(comment.id.clone(), comment.clone());
        debug!(comment_id = %comment.id, count = comments.len(), "Comment inserted");
        Ok(comment)
    }

    /// Comments on `beer_id`, newest first.
    pub fn list_comments(&self, beer_id: &str, skip: u64, limit: u64) -> Result<Listing<Comment>> {
        self.find_beer(beer_id)?;
        Ok(self.comments.page(
            |c| c.beer_id == beer_id,
            |c| (std::cmp::Reverse(c.date), c.id.clone()),
            skip,
            limit,
        ))
    }
}
