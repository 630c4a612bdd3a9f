//! Shared blog/post/comment model for the integration tests.
#![allow(dead_code)]

use querybuf::{
    EntityLoadInfo, EntityRef, EntityType, Error, FieldCollection, FieldReference, ForeignKey,
    Key, Materializer, Navigation, NavigationKind, Outcome, Property, RelatedStream, Result, Row,
    Value, new_entity, read_entity,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Row layout: `[id, name, created_by]`; `created_by` is a shadow column.
pub struct Blog {
    pub id: i64,
    pub name: String,
    pub posts: Option<Vec<EntityRef>>,
}

/// Row layout: `[id, blog_id, title]`; `blog_id` is a shadow column.
pub struct Post {
    pub id: i64,
    pub title: String,
    pub blog: Option<EntityRef>,
    pub comments: Option<Vec<EntityRef>>,
}

/// Row layout: `[id, post_id]`.
pub struct Comment {
    pub id: i64,
    pub post: Option<EntityRef>,
}

pub const BLOG_CREATED_BY: Property = Property::new("created_by", 2);
pub const POST_BLOG_ID: Property = Property::new("blog_id", 1);

pub struct Model {
    pub blog: Arc<EntityType>,
    pub post: Arc<EntityType>,
    pub comment: Arc<EntityType>,
    pub blog_posts: Arc<Navigation>,
    pub post_blog: Arc<Navigation>,
    pub post_comments: Arc<Navigation>,
    pub comment_post: Arc<Navigation>,
    pub blogs_built: Arc<AtomicUsize>,
    pub posts_built: Arc<AtomicUsize>,
    pub comments_built: Arc<AtomicUsize>,
    blog_materializer: Materializer,
    post_materializer: Materializer,
    comment_materializer: Materializer,
}

impl Model {
    pub fn new() -> Self {
        let blog_key = Key::new("Blog", vec![Property::new("id", 0)]);
        let post_key = Key::new("Post", vec![Property::new("id", 0)]);
        let comment_key = Key::new("Comment", vec![Property::new("id", 0)]);
        let blog = EntityType::new("Blog", Arc::clone(&blog_key));
        let post = EntityType::new("Post", Arc::clone(&post_key));
        let comment = EntityType::new("Comment", comment_key);

        let post_fk = ForeignKey::new(vec![POST_BLOG_ID], blog_key);
        let comment_fk = ForeignKey::new(vec![Property::new("post_id", 1)], post_key);

        let blog_posts = Navigation::new(
            "posts",
            Arc::clone(&blog),
            Arc::clone(&post),
            Arc::clone(&post_fk),
            NavigationKind::Collection(Arc::new(FieldCollection::<Blog>::new(|b| &mut b.posts))),
        );
        let post_blog = Navigation::new(
            "blog",
            Arc::clone(&post),
            Arc::clone(&blog),
            post_fk,
            NavigationKind::DependentToPrincipal(Arc::new(FieldReference::<Post>::new(
                |p| p.blog.clone(),
                |p, v| p.blog = v,
            ))),
        );
        Navigation::link(&blog_posts, &post_blog).expect("link blog/posts");

        let post_comments = Navigation::new(
            "comments",
            Arc::clone(&post),
            Arc::clone(&comment),
            Arc::clone(&comment_fk),
            NavigationKind::Collection(Arc::new(FieldCollection::<Post>::new(|p| {
                &mut p.comments
            }))),
        );
        let comment_post = Navigation::new(
            "post",
            Arc::clone(&comment),
            Arc::clone(&post),
            comment_fk,
            NavigationKind::DependentToPrincipal(Arc::new(FieldReference::<Comment>::new(
                |c| c.post.clone(),
                |c, v| c.post = v,
            ))),
        );
        Navigation::link(&post_comments, &comment_post).expect("link post/comments");

        let blogs_built = Arc::new(AtomicUsize::new(0));
        let posts_built = Arc::new(AtomicUsize::new(0));
        let comments_built = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&blogs_built);
        let blog_materializer: Materializer = Arc::new(move |row: &Row| -> Result<EntityRef> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(new_entity(Blog {
                id: row.get_as(0)?,
                name: row.get_as(1)?,
                posts: None,
            }))
        });
        let counter = Arc::clone(&posts_built);
        let post_materializer: Materializer = Arc::new(move |row: &Row| -> Result<EntityRef> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(new_entity(Post {
                id: row.get_as(0)?,
                title: row.get_as(2)?,
                blog: None,
                comments: None,
            }))
        });
        let counter = Arc::clone(&comments_built);
        let comment_materializer: Materializer = Arc::new(move |row: &Row| -> Result<EntityRef> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(new_entity(Comment {
                id: row.get_as(0)?,
                post: None,
            }))
        });

        Self {
            blog,
            post,
            comment,
            blog_posts,
            post_blog,
            post_comments,
            comment_post,
            blogs_built,
            posts_built,
            comments_built,
            blog_materializer,
            post_materializer,
            comment_materializer,
        }
    }

    pub fn blog_key(&self) -> &Arc<Key> {
        self.blog.primary_key()
    }

    pub fn post_key(&self) -> &Arc<Key> {
        self.post.primary_key()
    }

    pub fn blog_row(&self, id: i64, name: &str) -> EntityLoadInfo {
        EntityLoadInfo::new(
            Row::from_values(vec![Value::BigInt(id), Value::from(name), Value::from("admin")]),
            Arc::clone(&self.blog_materializer),
        )
    }

    pub fn null_blog_row(&self) -> EntityLoadInfo {
        EntityLoadInfo::new(
            Row::from_values(vec![Value::Null, Value::Null, Value::Null]),
            Arc::clone(&self.blog_materializer),
        )
    }

    pub fn post_row(&self, id: Option<i64>, blog_id: i64, title: &str) -> EntityLoadInfo {
        EntityLoadInfo::new(
            Row::from_values(vec![
                Value::from(id),
                Value::BigInt(blog_id),
                Value::from(title),
            ]),
            Arc::clone(&self.post_materializer),
        )
    }

    pub fn comment_row(&self, id: i64, post_id: i64) -> EntityLoadInfo {
        EntityLoadInfo::new(
            Row::from_values(vec![Value::BigInt(id), Value::BigInt(post_id)]),
            Arc::clone(&self.comment_materializer),
        )
    }
}

pub fn stream_of(rows: Vec<EntityLoadInfo>) -> RelatedStream {
    Box::new(rows.into_iter().map(Ok))
}

pub fn blog_post_ids(blog: &EntityRef) -> Option<Vec<i64>> {
    let posts = read_entity::<Blog, _>(blog, |b| b.posts.clone()).expect("blog entity")?;
    Some(posts.iter().map(post_id).collect())
}

pub fn post_id(post: &EntityRef) -> i64 {
    read_entity::<Post, _>(post, |p| p.id).expect("post entity")
}

pub fn post_blog(post: &EntityRef) -> Option<EntityRef> {
    read_entity::<Post, _>(post, |p| p.blog.clone()).expect("post entity")
}

pub fn post_comment_ids(post: &EntityRef) -> Option<Vec<i64>> {
    let comments = read_entity::<Post, _>(post, |p| p.comments.clone()).expect("post entity")?;
    Some(
        comments
            .iter()
            .map(|c| read_entity::<Comment, _>(c, |c| c.id).expect("comment entity"))
            .collect(),
    )
}

pub fn read_posts(blog: &EntityRef) -> Vec<EntityRef> {
    read_entity::<Blog, _>(blog, |b| b.posts.clone())
        .expect("blog entity")
        .unwrap_or_default()
}
